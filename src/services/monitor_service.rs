use log::{error, info, warn};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::driver::{ConnectionState, PlDriver, SolarSnapshot};
use crate::output::{ConsoleFormatter, ReadingFormatter};
use crate::utils::error::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitorSummary {
    pub polls: u64,
    pub complete: u64,
    pub partial: u64,
    pub skipped: u64,
}

impl MonitorSummary {
    pub fn success_rate(&self) -> f64 {
        if self.polls == 0 {
            return 0.0;
        }
        self.complete as f64 / self.polls as f64 * 100.0
    }
}

/// Polls `read_all` on a fixed interval and prints each snapshot.
pub struct MonitorService {
    driver: Arc<PlDriver>,
    formatter: Box<dyn ReadingFormatter>,
    interval: Duration,
}

impl MonitorService {
    pub fn new(driver: Arc<PlDriver>, interval: Duration) -> Self {
        Self {
            driver,
            formatter: Box::new(ConsoleFormatter),
            interval,
        }
    }

    pub fn set_formatter(&mut self, formatter: Box<dyn ReadingFormatter>) {
        info!("🎨 Changed monitor formatter");
        self.formatter = formatter;
    }

    /// Runs until Ctrl-C.
    pub async fn run(&self) -> Result<MonitorSummary> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("❌ Cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    pub async fn run_until<F>(&self, shutdown: F) -> Result<MonitorSummary>
    where
        F: Future<Output = ()>,
    {
        info!("🔄 Starting monitor, polling every {:?}", self.interval);
        info!("🛑 Press Ctrl+C to stop");

        let mut summary = MonitorSummary::default();
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut states = self.driver.state_changes();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("🛑 Stopping monitor...");
                    break;
                }
                changed = states.changed() => {
                    if changed.is_err() {
                        warn!("⚠️  Connection state channel closed");
                        break;
                    }
                    let state = *states.borrow_and_update();
                    info!("🔌 Connection is now {}", state);
                }
                _ = ticker.tick() => {
                    if self.driver.state() != ConnectionState::Connected {
                        summary.skipped += 1;
                        warn!("📵 Link is {}, skipping poll", self.driver.state());
                        continue;
                    }

                    let snapshot = self.driver.read_all().await;
                    summary.polls += 1;
                    if snapshot.is_complete() {
                        summary.complete += 1;
                    } else {
                        summary.partial += 1;
                    }
                    self.emit(&snapshot);
                }
            }
        }

        info!("📊 Final Statistics:");
        info!("   ✅ Complete polls: {}", summary.complete);
        info!("   ⚠️  Partial polls: {}", summary.partial);
        info!("   📵 Skipped polls: {}", summary.skipped);
        info!("   📈 Success rate: {:.1}%", summary.success_rate());
        Ok(summary)
    }

    fn emit(&self, snapshot: &SolarSnapshot) {
        match self.formatter.format_snapshot(snapshot) {
            Ok(text) => {
                let header = self.formatter.format_header();
                if !header.is_empty() {
                    print!("{}", header);
                }
                println!("{}", text);
            }
            Err(e) => error!("❌ Failed to format snapshot: {}", e),
        }
    }
}
