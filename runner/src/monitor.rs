use crossbeam_channel::{after, select, Receiver, Sender};
use std::time::Duration;
use sysinfo::System;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("resource probing is not supported on this platform")]
    Unsupported,
    #[error("failed to probe {resource} utilization: {reason}")]
    Probe {
        resource: &'static str,
        reason: String,
    },
}

/// One instantaneous utilization reading, both values in percent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub cpu: f64,
    pub memory: f64,
}

/// Source of utilization readings
pub trait Probe: Send {
    fn sample(&mut self) -> Result<Sample, MonitorError>;
}

/// Probe backed by the OS counters exposed through `sysinfo`
pub struct SysinfoProbe {
    system: System,
}

impl SysinfoProbe {
    pub fn new() -> Result<Self, MonitorError> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(MonitorError::Unsupported);
        }

        let mut system = System::new();
        // cpu usage is computed between two refreshes, take the baseline now
        system.refresh_cpu();

        Ok(Self { system })
    }
}

impl Probe for SysinfoProbe {
    fn sample(&mut self) -> Result<Sample, MonitorError> {
        self.system.refresh_cpu();
        self.system.refresh_memory();

        if self.system.cpus().is_empty() {
            return Err(MonitorError::Probe {
                resource: "cpu",
                reason: "no cpus reported".to_owned(),
            });
        }

        let total = self.system.total_memory();
        if total == 0 {
            return Err(MonitorError::Probe {
                resource: "memory",
                reason: "total memory reported as 0".to_owned(),
            });
        }

        Ok(Sample {
            cpu: f64::from(self.system.global_cpu_info().cpu_usage()),
            memory: self.system.used_memory() as f64 / total as f64 * 100.0,
        })
    }
}

/// Sample `probe` every `interval` and publish on `out` until `stop` is closed
///
/// `out` is consumed and dropped on every return path, a receiver draining it always observes the
/// end of the stream, also when probing fails.
pub fn monitor<P: Probe + ?Sized>(
    interval: Duration,
    stop: &Receiver<()>,
    out: Sender<Sample>,
    probe: &mut P,
) -> Result<(), MonitorError> {
    let mut count = 0usize;

    loop {
        select! {
            recv(stop) -> _ => {
                debug!(samples = count, "Stopped resource monitor");

                return Ok(());
            }
            recv(after(interval)) -> _ => {
                let sample = probe.sample()?;
                trace!(cpu = sample.cpu, memory = sample.memory, "Took sample");

                if out.send(sample).is_err() {
                    debug!("Sample receiver is gone, stopping resource monitor");

                    return Ok(());
                }
                count += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{monitor, MonitorError, Probe, Sample};
    use crossbeam_channel::{bounded, unbounded};
    use std::{thread, time::Duration};

    struct FixedProbe {
        taken: usize,
        fail_after: Option<usize>,
    }

    impl Probe for FixedProbe {
        fn sample(&mut self) -> Result<Sample, MonitorError> {
            if Some(self.taken) == self.fail_after {
                return Err(MonitorError::Probe {
                    resource: "cpu",
                    reason: "gone".to_owned(),
                });
            }
            self.taken += 1;

            Ok(Sample {
                cpu: self.taken as f64,
                memory: 50.0,
            })
        }
    }

    #[test]
    fn closes_output_on_stop() {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let (out_tx, out_rx) = unbounded();

        let handle = thread::spawn(move || {
            let mut probe = FixedProbe {
                taken: 0,
                fail_after: None,
            };
            monitor(Duration::from_millis(10), &stop_rx, out_tx, &mut probe)
        });

        thread::sleep(Duration::from_millis(100));
        drop(stop_tx);

        let samples = out_rx.iter().collect::<Vec<_>>();
        assert!(handle.join().unwrap().is_ok());
        assert!(!samples.is_empty());
        assert!(samples
            .iter()
            .enumerate()
            .all(|(index, sample)| sample.cpu == (index + 1) as f64));
    }

    #[test]
    fn closes_output_on_probe_failure() {
        let (_stop_tx, stop_rx) = bounded::<()>(0);
        let (out_tx, out_rx) = unbounded();

        let handle = thread::spawn(move || {
            let mut probe = FixedProbe {
                taken: 0,
                fail_after: Some(2),
            };
            monitor(Duration::from_millis(5), &stop_rx, out_tx, &mut probe)
        });

        // terminates although the stop signal is still open
        assert_eq!(out_rx.iter().count(), 2);
        assert!(matches!(
            handle.join().unwrap(),
            Err(MonitorError::Probe { resource: "cpu", .. })
        ));
    }

    #[test]
    fn stop_before_first_tick_yields_nothing() {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let (out_tx, out_rx) = unbounded();
        drop(stop_tx);

        let mut probe = FixedProbe {
            taken: 0,
            fail_after: None,
        };
        monitor(Duration::from_secs(60), &stop_rx, out_tx, &mut probe).unwrap();

        assert_eq!(out_rx.iter().count(), 0);
    }
}
