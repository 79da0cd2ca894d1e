//! The global ready queue (§4.H): a FIFO of runnable ManyMany descriptors
//! guarded by a dedicated lock.

use crate::descriptor::ThreadDescriptor;
use crate::spinlock::RawSpinlock;
use rt_list::List;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

/// `rt_list::List` is not `Sync` on its own (it exposes `&mut self`
/// methods only), so the ready queue wraps it behind our own spinlock
/// rather than handing out raw access.
pub(crate) struct ReadyQueue {
    lock: RawSpinlock,
    list: StdMutex<List<ThreadDescriptor>>,
}

impl ReadyQueue {
    pub(crate) fn new() -> Self {
        Self {
            lock: RawSpinlock::new(),
            list: StdMutex::new(List::new()),
        }
    }

    pub(crate) fn add(&self, descriptor: Arc<ThreadDescriptor>) {
        self.lock.acquire();
        self.list
            .lock()
            .expect("ready queue poisoned")
            .push_back(descriptor);
        self.lock.release();
    }

    /// Removes and returns the head of the queue, or `None` if empty.
    pub(crate) fn take(&self) -> Option<Arc<ThreadDescriptor>> {
        self.lock.acquire();
        let head = self.list.lock().expect("ready queue poisoned").pop_front();
        self.lock.release();
        head
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock.acquire();
        let empty = self.list.lock().expect("ready queue poisoned").is_empty();
        self.lock.release();
        empty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ThreadId;

    fn fake_descriptor() -> Arc<ThreadDescriptor> {
        ThreadDescriptor::new_one_one(
            ThreadId::next(),
            Box::new(|| Box::new(()) as Box<dyn std::any::Any + Send>),
        )
    }

    #[test]
    fn fifo_order() {
        let queue = ReadyQueue::new();
        assert!(queue.is_empty());

        let a = fake_descriptor();
        let b = fake_descriptor();
        let a_id = a.id;
        let b_id = b.id;

        queue.add(a);
        queue.add(b);

        assert_eq!(queue.take().unwrap().id, a_id);
        assert_eq!(queue.take().unwrap().id, b_id);
        assert!(queue.take().is_none());
    }
}
