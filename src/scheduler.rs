//! Poll cycle scheduler
//!
//! Every cycle queries all high-priority PIDs; a low-priority PID is queried
//! when `cycle % period == 0`, so the first cycle reads everything. Requests
//! are issued one after another, each bounded by the link's request timeout.
//! A failed or timed-out request yields an unknown sample and the cycle moves
//! on to the next PID.

use crate::logging::{StructuredLogger, get_logger};
use crate::obd::{self, PidDescriptor, PidTable, Priority};
use crate::telemetry::DecodedSample;
use crate::transport::AdapterLink;
use std::collections::HashMap;

/// Outcome of one poll cycle
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub cycle: u64,
    pub samples: Vec<DecodedSample>,
    /// Requests that failed at the transport level
    pub transport_failures: usize,
    /// Requests answered with text that did not decode
    pub decode_failures: usize,
}

impl CycleReport {
    /// Every request of the cycle failed at the transport level
    pub fn all_failed(&self) -> bool {
        !self.samples.is_empty() && self.transport_failures == self.samples.len()
    }
}

pub struct PollScheduler {
    table: PidTable,
    cycle: u64,
    low_priority_period: u64,
    period_overrides: HashMap<String, u64>,
    logger: StructuredLogger,
}

impl PollScheduler {
    /// `low_priority_period` is in cycles; values below 1 are treated as 1
    pub fn new(table: PidTable, low_priority_period: u64) -> Self {
        Self {
            table,
            cycle: 0,
            low_priority_period: low_priority_period.max(1),
            period_overrides: HashMap::new(),
            logger: get_logger("scheduler"),
        }
    }

    /// Give one low-priority PID its own period in cycles
    pub fn with_period(mut self, name: &str, period: u64) -> Self {
        self.period_overrides.insert(name.to_string(), period.max(1));
        self
    }

    pub fn table(&self) -> &PidTable {
        &self.table
    }

    /// Index of the next cycle to run
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Start over from cycle 0, e.g. after reconnecting
    pub fn reset(&mut self) {
        self.cycle = 0;
    }

    fn is_due(&self, pid: &PidDescriptor, cycle: u64) -> bool {
        match pid.priority() {
            Priority::High => true,
            Priority::Low => {
                let period = self
                    .period_overrides
                    .get(pid.name())
                    .copied()
                    .unwrap_or(self.low_priority_period);
                cycle % period == 0
            }
        }
    }

    /// PIDs queried by the current cycle, in table order
    pub fn due_pids(&self) -> Vec<&PidDescriptor> {
        self.table
            .iter()
            .filter(|p| self.is_due(p, self.cycle))
            .collect()
    }

    /// Run one cycle against the adapter and advance the cycle counter
    pub async fn run_cycle(&mut self, link: &mut AdapterLink) -> CycleReport {
        let cycle = self.cycle;
        let due: Vec<PidDescriptor> = self.due_pids().into_iter().cloned().collect();
        let mut report = CycleReport {
            cycle,
            ..Default::default()
        };

        // PIDs sharing a request (and header) are answered by one exchange
        let mut responses: HashMap<(Option<String>, String), String> = HashMap::new();

        for pid in &due {
            let key = (pid.header().map(str::to_string), pid.pid().to_string());
            let response = match responses.get(&key) {
                Some(cached) => Ok(cached.clone()),
                None => link.query(pid).await,
            };

            let sample = match response {
                Ok(text) => {
                    let sample = decode_sample(pid, &text);
                    if sample.is_unknown() {
                        report.decode_failures += 1;
                        self.logger.debug(&format!(
                            "PID {} undecodable: {:?}",
                            pid.name(),
                            text.trim()
                        ));
                    }
                    responses.insert(key, text);
                    sample
                }
                Err(e) => {
                    report.transport_failures += 1;
                    self.logger
                        .warn(&format!("PID {} request failed: {}", pid.name(), e));
                    DecodedSample::unknown(pid.name(), pid.pid_type())
                }
            };
            report.samples.push(sample);
        }

        self.cycle = self.cycle.wrapping_add(1);
        self.logger.debug(&format!(
            "Cycle {} done: {} PIDs, {} transport failures, {} undecodable",
            cycle,
            report.samples.len(),
            report.transport_failures,
            report.decode_failures
        ));
        report
    }
}

/// Decode one response, attaching per-cell values for array PIDs
pub fn decode_sample(pid: &PidDescriptor, response: &str) -> DecodedSample {
    let value = obd::try_decode(response, pid).unwrap_or(f64::NAN);
    let sample = DecodedSample::new(pid.name(), pid.pid_type(), value);
    if pid.pid_type().is_array() && !value.is_nan() {
        let cells = obd::reassemble_cells(response, pid.pid_type());
        if !cells.is_empty() {
            return sample.with_cells(cells);
        }
    }
    sample
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obd::PidType;
    use crate::transport::{Reply, ScriptedTransport};
    use std::time::Duration;

    fn table() -> PidTable {
        PidTable::new(vec![
            PidDescriptor::new("Speed", "010D", PidType::Speed),
            PidDescriptor::new("SOC", "015B", PidType::StateOfCharge),
            PidDescriptor::new("Odometer", "01A6", PidType::Odometer).with_priority(Priority::Low),
        ])
        .unwrap()
    }

    async fn open_link(t: &ScriptedTransport, timeout_ms: u64) -> AdapterLink {
        let mut link = AdapterLink::new(Box::new(t.clone()), Duration::from_millis(timeout_ms));
        link.open(&[]).await.unwrap();
        link
    }

    #[test]
    fn low_priority_due_on_period_multiples() {
        let mut s = PollScheduler::new(table(), 3);
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(s.due_pids().len());
            s.cycle += 1;
        }
        assert_eq!(seen, vec![3, 2, 2, 3, 2, 2, 3]);
    }

    #[test]
    fn per_pid_period_override() {
        let mut s = PollScheduler::new(table(), 60).with_period("Odometer", 2);
        s.cycle = 1;
        assert_eq!(s.due_pids().len(), 2);
        s.cycle = 2;
        assert_eq!(s.due_pids().len(), 3);
    }

    #[tokio::test]
    async fn cycle_decodes_all_due_pids() {
        let t = ScriptedTransport::new();
        t.respond("010D", "410D3C");
        t.respond("015B", "415B80");
        t.respond("01A6", "41A600002710");
        let mut link = open_link(&t, 100).await;

        let mut s = PollScheduler::new(table(), 60);
        let report = s.run_cycle(&mut link).await;
        assert_eq!(report.cycle, 0);
        assert_eq!(report.samples.len(), 3);
        assert_eq!(report.samples[0].value, 60.0);
        assert_eq!(report.samples[2].value, 1000.0);
        assert_eq!(s.cycle(), 1);

        let report = s.run_cycle(&mut link).await;
        assert_eq!(report.samples.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_yields_unknown_and_cycle_continues() {
        let t = ScriptedTransport::new();
        t.set_reply("010D", Reply::Hang);
        t.respond("015B", "415B80");
        t.respond("01A6", "NO DATA");
        let mut link = open_link(&t, 50).await;

        let mut s = PollScheduler::new(table(), 60);
        let report = s.run_cycle(&mut link).await;
        assert!(report.samples[0].is_unknown());
        assert!(!report.samples[1].is_unknown());
        assert!(report.samples[2].is_unknown());
        assert_eq!(report.transport_failures, 1);
        assert_eq!(report.decode_failures, 1);
        assert!(!report.all_failed());
    }

    #[tokio::test]
    async fn shared_request_is_sent_once() {
        let t = ScriptedTransport::new();
        t.respond("220101", "7EC 10 62 01 01 0D AC FF 9C");
        let mut link = open_link(&t, 100).await;
        let table = PidTable::new(vec![
            PidDescriptor::new("A", "220101", PidType::Custom)
                .with_header("7E4")
                .with_formula("B5"),
            PidDescriptor::new("B", "220101", PidType::Custom)
                .with_header("7E4")
                .with_formula("B6"),
        ])
        .unwrap();

        let mut s = PollScheduler::new(table, 60);
        let report = s.run_cycle(&mut link).await;
        assert_eq!(t.sent(), vec!["ATSH7E4", "220101"]);
        assert_eq!(report.samples[0].value, 172.0);
        assert_eq!(report.samples[1].value, 255.0);
    }

    #[tokio::test]
    async fn standard_pids_return_to_functional_address() {
        let t = ScriptedTransport::new();
        let mut link = open_link(&t, 100).await;
        let mut s = PollScheduler::new(PidTable::default_ev(), 60);
        s.run_cycle(&mut link).await;
        t.clear_sent();

        s.run_cycle(&mut link).await;
        assert_eq!(
            t.sent(),
            vec!["ATSH7DF", "015B", "010D", "ATSH7E4", "220101", "220105", "220106"]
        );
    }

    #[tokio::test]
    async fn closed_link_fails_every_request() {
        let t = ScriptedTransport::new();
        let mut link = open_link(&t, 100).await;
        t.drop_link();
        let mut s = PollScheduler::new(table(), 60);
        let report = s.run_cycle(&mut link).await;
        assert!(report.all_failed());
    }
}
