use std::collections::BTreeMap;

/// Accumulated cost of one operator kind.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct OpProfile {
    pub time_ms: f32,
    pub flops: f32,
    pub count: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Profiler {
    entries: BTreeMap<String, OpProfile>,
}

impl Profiler {
    pub(crate) fn reset(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn add_time(&mut self, kind: &str, ms: f32) {
        let entry = self.entries.entry(kind.to_string()).or_default();
        entry.time_ms += ms;
        entry.count += 1;
    }

    pub(crate) fn add_flops(&mut self, kind: &str, flops: f32) {
        self.entries.entry(kind.to_string()).or_default().flops += flops;
    }

    pub(crate) fn snapshot(&self) -> Vec<(String, OpProfile)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Log every kind, most expensive first.
    pub(crate) fn dump(&self) {
        let mut entries = self.snapshot();
        entries.sort_by(|a, b| b.1.time_ms.total_cmp(&a.1.time_ms));
        let mut total = OpProfile::default();
        for (kind, p) in &entries {
            tracing::info!(
                "{kind:<12} {:>10.3} ms {:>12.3} MFLOPs ({} runs)",
                p.time_ms,
                p.flops / 1e6,
                p.count
            );
            total.time_ms += p.time_ms;
            total.flops += p.flops;
        }
        tracing::info!(
            "total {:.3} ms, {:.3} MFLOPs",
            total.time_ms,
            total.flops / 1e6
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_per_kind() {
        let mut p = Profiler::default();
        p.add_time("MatMul", 1.5);
        p.add_time("MatMul", 0.5);
        p.add_flops("MatMul", 100.0);
        p.add_time("BinaryOp", 0.25);
        let snap = p.snapshot();
        assert_eq!(snap.len(), 2);
        let (_, mm) = snap.iter().find(|(k, _)| k == "MatMul").unwrap();
        assert_eq!(mm.count, 2);
        assert_eq!(mm.time_ms, 2.0);
        assert_eq!(mm.flops, 100.0);
        p.reset();
        assert!(p.snapshot().is_empty());
    }
}
