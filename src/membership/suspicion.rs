use crate::{common::NodeId, version::NodeVersion};

/// Reports accumulated against one suspect, at most one per reporter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SuspicionList {
    reports: Vec<(NodeId, NodeVersion)>,
}

impl SuspicionList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a report and returns whether it is new evidence: a reporter
    /// not heard from before, or a known reporter suspecting a strictly
    /// higher version. Stale and duplicate reports are no-ops.
    pub fn add(&mut self, reporter: NodeId, version: NodeVersion) -> bool {
        for report in &mut self.reports {
            if report.0 == reporter {
                if version > report.1 {
                    report.1 = version;
                    return true;
                }
                return false;
            }
        }

        self.reports.push((reporter, version));
        true
    }

    /// Purges reports against versions below `version`, once the node's
    /// status has moved past them (rebuttal or confirmed departure).
    pub fn delete_older(&mut self, version: NodeVersion) {
        self.reports.retain(|(_, v)| *v >= version);
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    pub fn clear(&mut self) {
        self.reports.clear();
    }
}
