use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};
use tracing::info;

use crate::switch::switch::Switch;
use crate::util::random::Random;

/// The active part around the synchronous [Switch]: feeds a monotonic
/// millisecond clock into the timer tasks and sleeps exactly as long as the
/// switch asks it to.
pub struct SwitchDriver<R: Random> {
    switch: Arc<Switch<R>>,
    reference_time: Instant,
    shutdown: Notify,
}

impl<R: Random> SwitchDriver<R> {
    pub fn new(switch: Arc<Switch<R>>) -> SwitchDriver<R> {
        SwitchDriver {
            switch,
            reference_time: Instant::now(),
            shutdown: Notify::new(),
        }
    }

    /// milliseconds since this driver was created - the `now` for every core call
    pub fn now_millis(&self) -> u64 {
        Instant::now().duration_since(self.reference_time).as_millis() as u64
    }

    pub async fn run(&self) {
        loop {
            let delay = self.switch.do_timer_tasks(self.now_millis());
            select! {
                _ = self.shutdown.notified() => {
                    info!("shutting down switch timer loop");
                    return;
                }
                _ = sleep(Duration::from_millis(delay)) => {}
            }
        }
    }

    pub fn trigger_shutdown(&self) {
        // notify_one stores a permit, so a shutdown between polls is not lost
        self.shutdown.notify_one();
    }
}
