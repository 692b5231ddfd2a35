use std::{sync::Mutex, time::Duration};

use tokio::{select, sync::Notify, time::Instant};
use tracing::trace;

/// Default quiet window before a rebuild fires.
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_millis(300);

/// Coalesces a burst of events into one firing: every `bump` pushes the
/// deadline out, and `settle` resolves once the window passes without a
/// bump. After settling, further bumps are refused so the caller knows to
/// queue a fresh debouncer for the next batch.
pub struct Debouncer {
    poke: Notify,
    generation: Mutex<Option<u64>>,
    window: Duration,
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE_WINDOW)
    }
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            poke: Notify::new(),
            generation: Mutex::new(Some(0)),
            window,
        }
    }

    /// Register an event. Returns false if this debouncer already settled
    /// and the event must go to a new one.
    pub fn bump(&self) -> bool {
        let mut generation = self.generation.lock().expect("debounce lock");
        match *generation {
            None => false,
            Some(current) => {
                *generation = Some(current + 1);
                self.poke.notify_one();
                true
            }
        }
    }

    /// Wait until the window elapses with no intervening bump. Consumes
    /// the debouncer's ability to accept further bumps.
    pub async fn settle(&self) {
        let mut observed = self
            .generation
            .lock()
            .expect("debounce lock")
            .expect("settle is called once");
        let mut deadline = Instant::now() + self.window;
        loop {
            select! {
                _ = self.poke.notified() => {
                    let current = self
                        .generation
                        .lock()
                        .expect("debounce lock")
                        .expect("only settle clears the generation");
                    if current != observed {
                        observed = current;
                        deadline = Instant::now() + self.window;
                        trace!("debounce window extended");
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let mut generation = self.generation.lock().expect("debounce lock");
                    let current = generation.expect("only settle clears the generation");
                    if current == observed {
                        // quiet for a full window: close the door and fire
                        *generation = None;
                        return;
                    }
                    // a bump landed between the timeout and the lock
                    observed = current;
                    deadline = Instant::now() + self.window;
                }
            }
        }
    }
}
