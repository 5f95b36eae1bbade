use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::router::RouterEvent;
use crate::types::RoomKey;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) enum TimerKind {
    AutoStart,
    Countdown,
    Deadline,
    BattleStart,
    BattleCleanup,
}

struct ArmedTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

// One-shot timers keyed by (room, kind). Firings go through the router as
// events; the generation lets it discard fires that were already in flight
// when the key was rearmed or cancelled.
pub(crate) struct TimerService {
    timers: DashMap<(RoomKey, TimerKind), ArmedTimer>,
    router_tx: mpsc::UnboundedSender<RouterEvent>,
    next_generation: AtomicU64,
}

impl TimerService {
    pub fn new(router_tx: mpsc::UnboundedSender<RouterEvent>) -> Self {
        Self {
            timers: DashMap::new(),
            router_tx,
            next_generation: AtomicU64::new(1),
        }
    }

    // Arming a key replaces whatever was armed under it.
    pub fn arm(&self, room: RoomKey, kind: TimerKind, delay: Duration) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let tx = self.router_tx.clone();
        let fire_room = room.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(RouterEvent::TimerFired {
                room: fire_room,
                kind,
                generation,
            });
        });
        if let Some(prev) = self.timers.insert((room, kind), ArmedTimer { generation, handle }) {
            prev.handle.abort();
        }
    }

    pub fn cancel(&self, room: &RoomKey, kind: TimerKind) {
        if let Some((_, timer)) = self.timers.remove(&(room.clone(), kind)) {
            timer.handle.abort();
        }
    }

    pub fn cancel_room(&self, room: &RoomKey) {
        self.timers.retain(|(r, _), timer| {
            if r == room {
                timer.handle.abort();
                false
            } else {
                true
            }
        });
    }

    // Consumes a firing; false means it was stale.
    pub fn acknowledge(&self, room: &RoomKey, kind: TimerKind, generation: u64) -> bool {
        self.timers
            .remove_if(&(room.clone(), kind), |_, timer| {
                timer.generation == generation
            })
            .is_some()
    }

    #[cfg(test)]
    pub fn armed_count(&self) -> usize {
        self.timers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (TimerService, mpsc::UnboundedReceiver<RouterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TimerService::new(tx), rx)
    }

    fn room() -> RoomKey {
        RoomKey::Arena(1)
    }

    #[tokio::test(start_paused = true)]
    async fn armed_timer_fires_once() {
        let (timers, mut rx) = service();
        timers.arm(room(), TimerKind::Countdown, Duration::from_secs(15));

        let event = rx.recv().await.unwrap();
        match event {
            RouterEvent::TimerFired {
                room: fired_room,
                kind,
                generation,
            } => {
                assert_eq!(fired_room, room());
                assert_eq!(kind, TimerKind::Countdown);
                assert!(timers.acknowledge(&fired_room, kind, generation));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(timers.armed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_the_previous_timer() {
        let (timers, mut rx) = service();
        timers.arm(room(), TimerKind::Deadline, Duration::from_secs(60));
        timers.arm(room(), TimerKind::Deadline, Duration::from_secs(1));
        assert_eq!(timers.armed_count(), 1);

        let event = rx.recv().await.unwrap();
        let RouterEvent::TimerFired { generation, .. } = event else {
            panic!("expected a timer firing");
        };
        assert!(timers.acknowledge(&room(), TimerKind::Deadline, generation));
        // The replaced 60s timer was aborted and never fires.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_does_not_fire() {
        let (timers, mut rx) = service();
        timers.arm(room(), TimerKind::AutoStart, Duration::from_secs(1));
        timers.cancel(&room(), TimerKind::AutoStart);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(timers.armed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_generation_is_rejected() {
        let (timers, mut rx) = service();
        timers.arm(room(), TimerKind::Deadline, Duration::from_secs(1));

        let event = rx.recv().await.unwrap();
        let RouterEvent::TimerFired { generation, .. } = event else {
            panic!("expected a timer firing");
        };
        // Rearmed after the fire was already queued: the old generation must
        // not be honored.
        timers.arm(room(), TimerKind::Deadline, Duration::from_secs(60));
        assert!(!timers.acknowledge(&room(), TimerKind::Deadline, generation));
        assert_eq!(timers.armed_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_room_drops_every_kind() {
        let (timers, mut rx) = service();
        timers.arm(room(), TimerKind::AutoStart, Duration::from_secs(1));
        timers.arm(room(), TimerKind::Countdown, Duration::from_secs(1));
        timers.arm(RoomKey::Arena(2), TimerKind::Countdown, Duration::from_secs(1));

        timers.cancel_room(&room());
        assert_eq!(timers.armed_count(), 1);

        let event = rx.recv().await.unwrap();
        let RouterEvent::TimerFired { room: fired, .. } = event else {
            panic!("expected a timer firing");
        };
        assert_eq!(fired, RoomKey::Arena(2));
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }
}
