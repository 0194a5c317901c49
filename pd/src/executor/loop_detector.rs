//! Run-level loop detection
//!
//! Two failure modes: the planner proposing the same plan over and over while
//! nothing gets applied, and one task failing again and again.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::guardrails::Severity;

/// Default number of repeats before a loop is declared
pub const DEFAULT_LOOP_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopSignal {
    /// Identical planning attempts with zero applied patches
    Planning { signature: String, count: u32 },
    /// Repeated failures of one task; the task is now permanently skipped
    Execution { task_id: String, count: u32 },
}

/// A workstream as seen by planning-loop mitigation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workstream {
    pub workstream_id: String,
    /// 1 is the most urgent
    pub priority: u32,
}

/// A gap as seen by planning-loop mitigation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub gap_id: String,
    pub severity: Severity,
}

/// Simplified plan after a planning loop
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlanningMitigation {
    pub workstreams: Vec<Workstream>,
    pub gaps: Vec<Gap>,
    pub dropped_workstreams: usize,
    pub dropped_gaps: usize,
}

#[derive(Debug)]
pub struct LoopDetector {
    planning_threshold: u32,
    execution_threshold: u32,
    planning_repeats: HashMap<String, u32>,
    execution_failures: HashMap<String, u32>,
    skipped: HashSet<String>,
    loops_detected: u32,
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(DEFAULT_LOOP_THRESHOLD, DEFAULT_LOOP_THRESHOLD)
    }
}

impl LoopDetector {
    pub fn new(planning_threshold: u32, execution_threshold: u32) -> Self {
        debug!(planning_threshold, execution_threshold, "LoopDetector::new: called");
        Self {
            planning_threshold: planning_threshold.max(1),
            execution_threshold: execution_threshold.max(1),
            planning_repeats: HashMap::new(),
            execution_failures: HashMap::new(),
            skipped: HashSet::new(),
            loops_detected: 0,
        }
    }

    /// Record one planning attempt identified by `signature`
    ///
    /// Any applied patch resets the counter for that signature.
    pub fn record_planning_attempt(&mut self, signature: &str, applied_patches: usize) -> Option<LoopSignal> {
        debug!(%signature, applied_patches, "LoopDetector::record_planning_attempt: called");
        if applied_patches > 0 {
            self.planning_repeats.remove(signature);
            return None;
        }
        let count = self.planning_repeats.entry(signature.to_string()).or_insert(0);
        *count += 1;
        if *count >= self.planning_threshold {
            let count = *count;
            self.planning_repeats.remove(signature);
            self.loops_detected += 1;
            warn!(%signature, count, "Planning loop detected");
            return Some(LoopSignal::Planning {
                signature: signature.to_string(),
                count,
            });
        }
        None
    }

    /// Seed the repeat counter from attempts made by earlier runs
    pub fn restore_planning_repeats(&mut self, signature: &str, repeats: u32) {
        debug!(%signature, repeats, "LoopDetector::restore_planning_repeats: called");
        if repeats == 0 {
            self.planning_repeats.remove(signature);
        } else {
            self.planning_repeats.insert(signature.to_string(), repeats);
        }
    }

    /// Record a failed execution; at the threshold the task is skipped for good
    pub fn record_execution_failure(&mut self, task_id: &str) -> Option<LoopSignal> {
        let count = self.execution_failures.entry(task_id.to_string()).or_insert(0);
        *count += 1;
        let count = *count;
        debug!(%task_id, count, "LoopDetector::record_execution_failure: called");
        if count >= self.execution_threshold && self.skipped.insert(task_id.to_string()) {
            self.loops_detected += 1;
            warn!(%task_id, count, "Execution loop detected, skipping task permanently");
            return Some(LoopSignal::Execution {
                task_id: task_id.to_string(),
                count,
            });
        }
        None
    }

    pub fn record_execution_success(&mut self, task_id: &str) {
        self.execution_failures.remove(task_id);
    }

    pub fn failures(&self, task_id: &str) -> u32 {
        self.execution_failures.get(task_id).copied().unwrap_or(0)
    }

    pub fn is_skipped(&self, task_id: &str) -> bool {
        self.skipped.contains(task_id)
    }

    pub fn loops_detected(&self) -> u32 {
        self.loops_detected
    }
}

/// Halve the workstreams (most urgent first) and keep only critical gaps
pub fn mitigate_planning_loop(mut workstreams: Vec<Workstream>, gaps: Vec<Gap>) -> PlanningMitigation {
    debug!(workstreams = workstreams.len(), gaps = gaps.len(), "mitigate_planning_loop: called");
    let total_workstreams = workstreams.len();
    let total_gaps = gaps.len();

    workstreams.sort_by_key(|w| w.priority);
    let keep = total_workstreams.div_ceil(2);
    workstreams.truncate(keep);

    let gaps: Vec<Gap> = gaps.into_iter().filter(|g| g.severity == Severity::Critical).collect();

    let mitigation = PlanningMitigation {
        dropped_workstreams: total_workstreams - workstreams.len(),
        dropped_gaps: total_gaps - gaps.len(),
        workstreams,
        gaps,
    };
    info!(
        kept_workstreams = mitigation.workstreams.len(),
        dropped_workstreams = mitigation.dropped_workstreams,
        kept_gaps = mitigation.gaps.len(),
        dropped_gaps = mitigation.dropped_gaps,
        "Applied planning loop mitigation"
    );
    mitigation
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ws(id: &str, priority: u32) -> Workstream {
        Workstream {
            workstream_id: id.to_string(),
            priority,
        }
    }

    fn gap(id: &str, severity: Severity) -> Gap {
        Gap {
            gap_id: id.to_string(),
            severity,
        }
    }

    #[test]
    fn test_planning_loop_after_threshold() {
        let mut detector = LoopDetector::default();
        assert_eq!(detector.record_planning_attempt("plan-a", 0), None);
        assert_eq!(detector.record_planning_attempt("plan-a", 0), None);
        assert_eq!(
            detector.record_planning_attempt("plan-a", 0),
            Some(LoopSignal::Planning {
                signature: "plan-a".to_string(),
                count: 3
            })
        );
        assert_eq!(detector.loops_detected(), 1);
    }

    #[test]
    fn test_restored_repeats_count_toward_threshold() {
        let mut detector = LoopDetector::new(3, 3);
        detector.restore_planning_repeats("plan-a", 2);
        assert!(matches!(
            detector.record_planning_attempt("plan-a", 0),
            Some(LoopSignal::Planning { count: 3, .. })
        ));

        detector.restore_planning_repeats("plan-b", 0);
        assert_eq!(detector.record_planning_attempt("plan-b", 0), None);
    }

    #[test]
    fn test_applied_patch_resets_planning_counter() {
        let mut detector = LoopDetector::new(2, 2);
        detector.record_planning_attempt("plan-a", 0);
        detector.record_planning_attempt("plan-a", 1);
        assert_eq!(detector.record_planning_attempt("plan-a", 0), None);
        // Different signatures are tracked separately
        assert_eq!(detector.record_planning_attempt("plan-b", 0), None);
        assert!(detector.record_planning_attempt("plan-a", 0).is_some());
    }

    #[test]
    fn test_execution_loop_skips_task_once() {
        let mut detector = LoopDetector::new(3, 2);
        assert_eq!(detector.record_execution_failure("t1"), None);
        assert!(!detector.is_skipped("t1"));
        assert!(matches!(
            detector.record_execution_failure("t1"),
            Some(LoopSignal::Execution { count: 2, .. })
        ));
        assert!(detector.is_skipped("t1"));
        assert_eq!(detector.record_execution_failure("t1"), None);
        assert_eq!(detector.loops_detected(), 1);
    }

    #[test]
    fn test_success_resets_failures() {
        let mut detector = LoopDetector::new(3, 2);
        detector.record_execution_failure("t1");
        detector.record_execution_success("t1");
        assert_eq!(detector.failures("t1"), 0);
        assert_eq!(detector.record_execution_failure("t1"), None);
    }

    #[test]
    fn test_mitigation_halves_workstreams_by_priority() {
        let mitigation = mitigate_planning_loop(
            vec![ws("c", 3), ws("a", 1), ws("e", 5), ws("b", 2), ws("d", 4)],
            vec![
                gap("g1", Severity::Critical),
                gap("g2", Severity::High),
                gap("g3", Severity::Warning),
                gap("g4", Severity::Critical),
            ],
        );
        let ids: Vec<_> = mitigation.workstreams.iter().map(|w| w.workstream_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(mitigation.dropped_workstreams, 2);
        let gaps: Vec<_> = mitigation.gaps.iter().map(|g| g.gap_id.as_str()).collect();
        assert_eq!(gaps, vec!["g1", "g4"]);
        assert_eq!(mitigation.dropped_gaps, 2);
    }

    #[test]
    fn test_mitigation_keeps_single_workstream() {
        let mitigation = mitigate_planning_loop(vec![ws("only", 7)], Vec::new());
        assert_eq!(mitigation.workstreams.len(), 1);
        assert_eq!(mitigation.dropped_workstreams, 0);
    }
}
