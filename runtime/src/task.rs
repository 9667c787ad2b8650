// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// An owning unit of work: a callable together with its captured arguments.
///
/// Construction is eager (the closure and its captures are boxed when the
/// task is built); invocation consumes the task. A task is owned by
/// whichever queue holds it until a worker hart dequeues and runs it.
pub struct Task {
    f: Box<dyn FnOnce() + Send + 'static>,
}

impl Task {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self { f: Box::new(f) }
    }

    /// Runs the task, consuming it.
    pub fn invoke(self) {
        (self.f)();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Task(..)")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn invoke_consumes_and_runs() {
        static RAN: AtomicU32 = AtomicU32::new(0);
        let task = Task::new(|| {
            RAN.fetch_add(1, Ordering::Relaxed);
        });
        task.invoke();
        assert_eq!(RAN.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn captures_move_into_the_task() {
        let payload = vec![1u8, 2, 3];
        let out = std::sync::Arc::new(AtomicU32::new(0));
        let out2 = out.clone();
        let task = Task::new(move || {
            out2.store(u32::from(payload[2]), Ordering::Relaxed);
        });
        task.invoke();
        assert_eq!(out.load(Ordering::Relaxed), 3);
    }
}
