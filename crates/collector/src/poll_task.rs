use std::fmt::Debug;
use std::time::Duration;

use log::{debug, error, info, warn};
use membw::{MonitorError, ResourceMonitor};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Counts of what a poll loop did before it stopped
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollSummary {
    pub polls: u64,
    pub failed_polls: u64,
}

/// Polls `monitor` every `period` until `token` is cancelled.
///
/// A poll that fails because of the compute driver is logged and skipped;
/// the next tick tries again. Any other monitor error ends the loop.
pub async fn poll_monitor<M: ResourceMonitor>(
    mut monitor: M,
    period: Duration,
    token: CancellationToken,
) -> Result<PollSummary, MonitorError> {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut summary = PollSummary::default();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        summary.polls += 1;
        match monitor.get_metrics() {
            Ok(samples) => {
                for sample in samples {
                    info!(
                        "{} {} source={} value={}",
                        sample.timestamp.format("%H:%M:%S%.3f"),
                        sample.name,
                        sample.source,
                        sample.value
                    );
                }
            }
            Err(e @ MonitorError::ResourceMonitor { .. }) => {
                summary.failed_polls += 1;
                warn!("Skipping poll of {}: {}", monitor.source(), e);
            }
            Err(e) => return Err(e),
        }
    }

    debug!("Poll loop stopped after {} polls", summary.polls);
    Ok(summary)
}

/// Awaits a spawned task, logs how it ended and cancels `token` either way.
///
/// Returns the task's value if it completed successfully.
pub async fn supervise<T, E>(
    handle: JoinHandle<Result<T, E>>,
    token: CancellationToken,
    task_name: &str,
) -> Option<T>
where
    T: Debug,
    E: Debug,
{
    let outcome = match handle.await {
        Ok(Ok(value)) => {
            info!("{} finished: {:?}", task_name, value);
            Some(value)
        }
        Ok(Err(e)) => {
            error!("{} failed with error: {:?}", task_name, e);
            None
        }
        Err(join_error) => {
            error!("{} panicked or was cancelled: {:?}", task_name, join_error);
            None
        }
    };

    token.cancel();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use membw::{DriverError, MetricName, MetricValue};
    use std::collections::VecDeque;

    /// Monitor replaying canned poll outcomes, then cancelling the loop
    struct CannedMonitor {
        outcomes: VecDeque<Result<(), MonitorError>>,
        token: CancellationToken,
    }

    impl ResourceMonitor for CannedMonitor {
        fn source(&self) -> &str {
            "canned"
        }

        fn get_metric_names(&self) -> &'static [MetricName] {
            &[MetricName::Max]
        }

        fn get_metric(
            &mut self,
            _name: &str,
        ) -> Result<(MetricValue, DateTime<Utc>), MonitorError> {
            let outcome = self.outcomes.pop_front().unwrap_or(Ok(()));
            if self.outcomes.is_empty() {
                self.token.cancel();
            }
            outcome.map(|_| (MetricValue::Ceiling(7), DateTime::<Utc>::UNIX_EPOCH))
        }
    }

    fn driver_failure() -> MonitorError {
        MonitorError::ResourceMonitor {
            monitor: membw::MONITOR_NAME,
            source: DriverError::Unavailable("down".into()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_failures_are_skipped() {
        let token = CancellationToken::new();
        let monitor = CannedMonitor {
            outcomes: VecDeque::from([Ok(()), Err(driver_failure()), Ok(())]),
            token: token.clone(),
        };

        let summary = poll_monitor(monitor, Duration::from_secs(5), token)
            .await
            .unwrap();
        assert_eq!(
            summary,
            PollSummary {
                polls: 3,
                failed_polls: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_metric_stops_loop() {
        let token = CancellationToken::new();
        let monitor = CannedMonitor {
            outcomes: VecDeque::from([
                Ok(()),
                Err(MonitorError::UnknownMetric("x".into())),
                Ok(()),
            ]),
            token: token.clone(),
        };

        let result = poll_monitor(monitor, Duration::from_secs(1), token).await;
        assert_eq!(result, Err(MonitorError::UnknownMetric("x".into())));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_tick() {
        let token = CancellationToken::new();
        token.cancel();
        let monitor = CannedMonitor {
            outcomes: VecDeque::new(),
            token: token.clone(),
        };

        let summary = poll_monitor(monitor, Duration::from_secs(60), token)
            .await
            .unwrap();
        assert_eq!(summary.polls, 0);
    }

    #[tokio::test]
    async fn test_supervise_success() {
        testing_logger::setup();

        let token = CancellationToken::new();
        let handle = tokio::spawn(async { Ok::<_, String>(PollSummary::default()) });

        let value = supervise(handle, token.clone(), "poller").await;
        assert_eq!(value, Some(PollSummary::default()));
        assert!(token.is_cancelled());

        testing_logger::validate(|captured_logs| {
            assert_eq!(captured_logs.len(), 1);
            assert_eq!(captured_logs[0].level, log::Level::Info);
            assert_eq!(
                captured_logs[0].body,
                "poller finished: PollSummary { polls: 0, failed_polls: 0 }"
            );
        });
    }

    #[tokio::test]
    async fn test_supervise_error() {
        testing_logger::setup();

        let token = CancellationToken::new();
        let handle = tokio::spawn(async { Err::<(), _>(MonitorError::UnknownMetric("y".into())) });

        assert_eq!(supervise(handle, token.clone(), "poller").await, None);
        assert!(token.is_cancelled());

        testing_logger::validate(|captured_logs| {
            assert_eq!(captured_logs.len(), 1);
            assert_eq!(captured_logs[0].level, log::Level::Error);
            assert_eq!(
                captured_logs[0].body,
                "poller failed with error: UnknownMetric(\"y\")"
            );
        });
    }

    #[tokio::test]
    async fn test_supervise_panic() {
        testing_logger::setup();

        let token = CancellationToken::new();
        let handle = tokio::spawn(async {
            panic!("sampler exploded");
            #[allow(unreachable_code)]
            Ok::<(), String>(())
        });

        assert_eq!(supervise(handle, token.clone(), "poller").await, None);
        assert!(token.is_cancelled());

        testing_logger::validate(|captured_logs| {
            assert_eq!(captured_logs.len(), 1);
            assert!(captured_logs[0]
                .body
                .starts_with("poller panicked or was cancelled:"));
            assert!(captured_logs[0].body.contains("sampler exploded"));
        });
    }
}
