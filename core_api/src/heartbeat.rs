use {
    std::{sync::Mutex, time::Duration},
    tokio::{
        sync::broadcast,
        task::JoinHandle,
        time::{interval, MissedTickBehavior},
    },
    tracing::debug,
};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// A single heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pulse;

/// Periodic pulse driving expiration scans and pending subscription retries.
#[derive(Debug)]
pub struct HeartBeat {
    interval: Duration,
    sender: broadcast::Sender<Pulse>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HeartBeat {
    pub fn new(interval: Duration) -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            interval,
            sender,
            task: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Starts ticking. Calling it on a running heartbeat does nothing.
    pub fn start(&self) {
        let Ok(mut task) = self.task.lock() else {
            return;
        };
        if task.is_some() {
            return;
        }

        let sender = self.sender.clone();
        let period = self.interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                // No receivers is fine, they may subscribe later.
                let _ = sender.send(Pulse);
            }
        }));
        debug!(interval = ?self.interval, "heartbeat started");
    }

    pub fn stop(&self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
                debug!("heartbeat stopped");
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Pulse> {
        self.sender.subscribe()
    }
}

impl Default for HeartBeat {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_INTERVAL)
    }
}

impl Drop for HeartBeat {
    fn drop(&mut self) {
        self.stop();
    }
}
