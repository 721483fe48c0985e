/*!
Object wait queues

Any object, the folio itself included, can have messengers waiting on
it: senders waiting for a receiver, callers waiting for the object's
destruction, callers waiting for activity statistics.

The queue is a circular doubly linked list threaded through the waiting
messengers and anchored in the folio metadata, which records whether a
queue exists and which messenger is its head:

```text
  meta.head ──► m0 ──► m1 ──► m2 ──► (object oid)
                 ▲              │
                 └──── prev ────┘
```

The tail's `next` names the object waited on, and the head's `prev`
names the tail. Every operation checks these links; a broken link means
the store is corrupt and panics.

All queue operations run under the kernel wait lock.
*/
use alloc::vec::Vec;

use viengoos_abi::message::Message;

use crate::{kernel::WaitLocked, object::Oid, Kernel};

/// Upper bound on a queue length, used to catch cycles.
const MAX_QUEUE_LENGTH: usize = 1 << 20;

/// Queue anchor kept in the folio metadata for every object.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WaitHead {
    /// A queue exists.
    pub(crate) present: bool,
    /// Its first messenger. Only meaningful when `present`.
    pub(crate) head: Oid,
}

/// Why a messenger sits on a wait queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    /// Waiting for the object, a messenger, to receive.
    Send,
    /// Waiting for the object to be destroyed.
    Destruction,
    /// Waiting for an activity sample of at least this period.
    ActivityInfo { until_period: u32 },
    /// Waiting for an activity to come under memory pressure.
    ActivityPressure,
}

/// Queue links kept in every messenger.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WaitLink {
    pub(crate) queued: bool,
    pub(crate) head: bool,
    pub(crate) tail: bool,
    pub(crate) next: Oid,
    pub(crate) prev: Oid,
    pub(crate) reason: Option<WaitReason>,
}

impl Kernel {
    fn link(&self, messenger: Oid) -> WaitLink {
        match self.messenger_by_oid(messenger) {
            Some(m) => m.lock().wait,
            None => panic!("invariant broken: queued messenger {} is gone", messenger),
        }
    }

    fn update_link(&self, messenger: Oid, f: impl FnOnce(&mut WaitLink)) {
        match self.messenger_by_oid(messenger) {
            Some(m) => f(&mut m.lock().wait),
            None => panic!("invariant broken: queued messenger {} is gone", messenger),
        }
    }

    fn wait_head(&self, object: Oid) -> WaitHead {
        self.with_wait_head(object, |head| *head)
            .unwrap_or_else(|| panic!("invariant broken: no folio for {}", object))
    }

    fn set_wait_head(&self, object: Oid, value: WaitHead) {
        let updated = self.with_wait_head(object, |head| *head = value);
        invariant!(updated.is_some(), "no folio for {}", object);
    }

    /// Append `messenger` to the queue of `object`.
    pub(crate) fn wait_enqueue(
        &self,
        _locked: &WaitLocked<'_>,
        object: Oid,
        messenger: Oid,
        reason: WaitReason,
    ) {
        invariant!(
            !self.link(messenger).queued,
            "messenger {} is already queued",
            messenger
        );

        let head = self.wait_head(object);
        if !head.present {
            self.update_link(messenger, |link| {
                *link = WaitLink {
                    queued: true,
                    head: true,
                    tail: true,
                    next: object,
                    prev: messenger,
                    reason: Some(reason),
                }
            });
            self.set_wait_head(
                object,
                WaitHead {
                    present: true,
                    head: messenger,
                },
            );
        } else {
            let tail = self.link(head.head).prev;
            self.update_link(tail, |link| {
                invariant!(
                    link.tail && link.next == object,
                    "tail {} of {} does not close the queue",
                    tail,
                    object
                );
                link.tail = false;
                link.next = messenger;
            });
            self.update_link(messenger, |link| {
                *link = WaitLink {
                    queued: true,
                    head: false,
                    tail: true,
                    next: object,
                    prev: tail,
                    reason: Some(reason),
                }
            });
            self.update_link(head.head, |link| link.prev = messenger);
        }
        trace!("{} waits on {} ({:?})", messenger, object, reason);
    }

    /// The object whose queue `messenger` is on.
    fn queued_on(&self, messenger: Oid) -> Oid {
        let mut link = self.link(messenger);
        for _ in 0..MAX_QUEUE_LENGTH {
            if link.tail {
                return link.next;
            }
            let next = link.next;
            link = self.link(next);
            invariant!(link.queued, "messenger {} linked but not queued", next);
        }
        panic!("invariant broken: wait queue through {} does not end", messenger);
    }

    /// Remove `messenger` from whatever queue it is on. Returns the
    /// object it waited on and the reason, or `None` if it was not
    /// queued.
    pub(crate) fn wait_dequeue(
        &self,
        _locked: &WaitLocked<'_>,
        messenger: Oid,
    ) -> Option<(Oid, WaitReason)> {
        // A messenger that is gone was unlinked when it was destroyed.
        self.messenger_by_oid(messenger)?;
        let link = self.link(messenger);
        if !link.queued {
            return None;
        }
        let object = self.queued_on(messenger);

        match (link.head, link.tail) {
            (true, true) => self.set_wait_head(object, WaitHead::default()),
            (true, false) => {
                let next = link.next;
                self.update_link(next, |next_link| {
                    next_link.head = true;
                    next_link.prev = link.prev;
                });
                self.set_wait_head(
                    object,
                    WaitHead {
                        present: true,
                        head: next,
                    },
                );
            }
            (false, true) => {
                let prev = link.prev;
                self.update_link(prev, |prev_link| {
                    prev_link.tail = true;
                    prev_link.next = object;
                });
                let head = self.wait_head(object);
                self.update_link(head.head, |head_link| head_link.prev = prev);
            }
            (false, false) => {
                let (prev, next) = (link.prev, link.next);
                self.update_link(prev, |prev_link| prev_link.next = next);
                self.update_link(next, |next_link| next_link.prev = prev);
            }
        }

        self.update_link(messenger, |link| *link = WaitLink::default());
        trace!("{} leaves the queue of {}", messenger, object);
        link.reason.map(|reason| (object, reason))
    }

    /// The messengers waiting on `object`, head first, with their
    /// reasons. Checks the queue invariants on the way.
    pub(crate) fn wait_queue(&self, object: Oid) -> Vec<(Oid, WaitReason)> {
        let head = self.wait_head(object);
        let mut waiters = Vec::new();
        if !head.present {
            return waiters;
        }

        let head_link = self.link(head.head);
        invariant!(head_link.head, "queue head {} of {} not flagged", head.head, object);

        let mut current = head.head;
        let mut link = head_link;
        loop {
            invariant!(link.queued, "messenger {} on {} not queued", current, object);
            invariant!(
                waiters.len() < MAX_QUEUE_LENGTH,
                "wait queue of {} does not end",
                object
            );
            invariant!(
                link.head == (current == head.head),
                "head flag of {} out of place",
                current
            );
            waiters.push((current, link.reason.unwrap_or(WaitReason::Send)));
            if link.tail {
                invariant!(
                    link.next == object,
                    "tail {} points at {} instead of {}",
                    current,
                    link.next,
                    object
                );
                invariant!(
                    head_link.prev == current,
                    "head of {} points at {} instead of the tail {}",
                    object,
                    head_link.prev,
                    current
                );
                break;
            }
            current = link.next;
            link = self.link(current);
        }
        waiters
    }

    /// Dequeue every waiter on `object` and complete it with a reply
    /// carrying `return_code`.
    pub(crate) fn wake_all(&self, locked: &WaitLocked<'_>, object: Oid, return_code: u64) -> usize {
        let waiters = self.wait_queue(object);
        for (messenger, _) in waiters.iter() {
            self.wait_dequeue(locked, *messenger);
            let mut reply = Message::new();
            reply.append_word(0);
            reply.append_word(return_code);
            self.messenger_complete(locked, *messenger, &reply);
        }
        if !waiters.is_empty() {
            debug!(
                "woke {} waiters on {} with {}",
                waiters.len(),
                object,
                return_code
            );
        }
        waiters.len()
    }
}
