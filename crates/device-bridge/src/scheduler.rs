//! Scheduled tasks
//!
//! "Run this check every T until it says stop, or until cancelled", plus
//! one-shot timers. Both run on the runtime handle they were created with,
//! so callers do not need to be inside a tokio context.

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct Scheduler {
    runtime: Handle,
}

impl Scheduler {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Run `tick` every `period`, first after one full period.
    ///
    /// `tick` receives the 1-based tick count. The task stops when `tick`
    /// returns [`ControlFlow::Break`] (which also cancels `token`) or when
    /// `token` is cancelled from outside.
    pub fn periodic<F, Fut>(&self, period: Duration, token: CancellationToken, mut tick: F) -> JoinHandle<()>
    where
        F: FnMut(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        self.runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut count = 0u64;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }

                count += 1;
                if tick(count).await.is_break() {
                    token.cancel();
                    break;
                }
            }
        })
    }

    /// Run `task` once after `delay` unless `token` is cancelled first
    pub fn once<F, Fut>(&self, delay: Duration, token: CancellationToken, task: F) -> JoinHandle<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => task().await,
            }
        })
    }

    /// Run `task` as soon as possible
    pub fn spawn<Fut>(&self, task: Fut) -> JoinHandle<()>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(task)
    }
}
