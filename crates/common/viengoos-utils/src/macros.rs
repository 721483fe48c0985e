/// Entry point of thread panic.  For details on `panic`, see std::macros.
///
/// # Uses
///
/// Unlike [`panic!`], `debug_panic!` statements are only enabled in non
/// optimized builds by default. An optimized build will omit all
/// `debug_panic!` statements unless `-C debug-assertions` is passed to the
/// compiler.
#[macro_export]
macro_rules! debug_panic {
    ($($arg:tt)*) => (if cfg!(debug_assertions) { panic!($($arg)*); })
}

/// Panics with an "invariant broken" message when `cond` does not hold.
///
/// Used for internal consistency checks (wait queue links, lock state)
/// whose failure means the data structure itself is corrupt. These are
/// never caller errors and are checked in every build.
#[macro_export]
macro_rules! invariant {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            panic!("invariant broken: {}", format_args!($($arg)+));
        }
    };
}
