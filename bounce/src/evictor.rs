//! Background task that drives the eviction clock.

use crate::{manager::Manager, Platform};
use commonware_runtime::{Clock, Handle, Spawner};
use futures::{channel::mpsc, StreamExt};
use std::{sync::Weak, time::Duration};
use tracing::debug;

/// Ticks the [Manager]'s eviction clock every `interval` while any slot is cached.
///
/// The task sleeps on the wakeup channel while the caches are empty and exits once the
/// [Manager] is dropped.
pub struct Evictor<E: Clock + Spawner, P: Platform, O: Clone + Send + 'static> {
    context: E,
    manager: Weak<Manager<P, O>>,
    interval: Duration,
    wake: mpsc::UnboundedReceiver<()>,
}

impl<E: Clock + Spawner, P: Platform, O: Clone + Send + 'static> Evictor<E, P, O> {
    pub fn new(
        context: E,
        manager: Weak<Manager<P, O>>,
        interval: Duration,
        wake: mpsc::UnboundedReceiver<()>,
    ) -> Self {
        Self {
            context,
            manager,
            interval,
            wake,
        }
    }

    pub fn start(self) -> Handle<()> {
        self.context.clone().spawn(|_| self.run())
    }

    async fn run(mut self) {
        while self.wake.next().await.is_some() {
            debug!("eviction clock started");
            loop {
                self.context.sleep(self.interval).await;
                let Some(manager) = self.manager.upgrade() else {
                    return;
                };
                if manager.evict() || manager.disarm() {
                    continue;
                }
                break;
            }
            debug!("eviction clock stopped");
        }
    }
}
