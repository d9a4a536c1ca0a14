//! Periodic removal of expired result records and settled chords.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::domain::SkeinError;
use crate::ports::{ChordStore, ResultStore};

use super::background::{LoopHandle, sleep_or_shutdown};

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Swept {
    pub results: usize,
    pub chords: usize,
}

pub struct GcLoop {
    results: Arc<dyn ResultStore>,
    chords: Option<(Arc<dyn ChordStore>, Duration)>,
    interval: Duration,
}

impl GcLoop {
    pub fn new(results: Arc<dyn ResultStore>, interval: Duration) -> Self {
        Self {
            results,
            chords: None,
            interval,
        }
    }

    /// Also drop chords that settled at least `retention` ago.
    pub fn with_chords(mut self, chords: Arc<dyn ChordStore>, retention: Duration) -> Self {
        self.chords = Some((chords, retention));
        self
    }

    pub async fn sweep_once(&self) -> Result<Swept, SkeinError> {
        let mut swept = Swept {
            results: self.results.sweep_expired().await?,
            chords: 0,
        };
        if let Some((chords, retention)) = &self.chords {
            swept.chords = chords.sweep_settled(*retention).await?;
        }
        if swept != Swept::default() {
            tracing::info!(results = swept.results, chords = swept.chords, "expired state swept");
        }
        Ok(swept)
    }

    pub fn spawn(self) -> LoopHandle {
        LoopHandle::spawn("gc", move |rx| self.run(rx))
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        while sleep_or_shutdown(self.interval, &mut shutdown_rx).await {
            if let Err(e) = self.sweep_once().await {
                tracing::error!(error = %e, "sweep failed");
            }
        }
    }
}
