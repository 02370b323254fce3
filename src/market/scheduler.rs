use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Handle to a fixed-interval job started by [`schedule`].
///
/// The first cycle fires immediately. Every tick spawns the job's future as
/// its own task, so a slow cycle never holds back the next one and cycles may
/// overlap. Cancelling stops future ticks only; cycles already spawned run to
/// completion and their owners are expected to discard late results.
/// Dropping the handle cancels it.
pub struct RepeatingTask {
    cancellation_token: CancellationToken,
}

impl RepeatingTask {
    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

pub fn schedule<F, Fut>(interval: Duration, mut job: F) -> RepeatingTask
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let cancellation_token = CancellationToken::new();
    let task_token = cancellation_token.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = task_token.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::spawn(job());
                }
            }
        }
    });

    RepeatingTask { cancellation_token }
}
