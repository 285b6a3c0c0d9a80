use lockscope_core::engine::EngineReport;
use lockscope_core::graph::Deadlock;
use lockscope_core::hotness::LockHotnessWave;
use lockscope_core::record::{ContentionRecord, ContentionSummary, LockContentionReport};
use lockscope_core::snapshot::ThreadId;
use std::fmt::Write;

/// Points the hotness wave is sampled at when summarizing a report
const WAVE_SAMPLES: usize = 64;

pub fn render_report(report: &EngineReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "🔒 Lockscope report {} ({})",
        report.session_id,
        report.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let _ = writeln!(
        out,
        "   window {}..{} ms, {} samples, {} snapshots, {} dropped",
        report.window.start_ms,
        report.window.end_ms,
        report.stats.samples,
        report.stats.ingested,
        report.stats.dropped
    );
    out.push('\n');

    out.push_str(&render_contention(&report.top_contention));
    out.push('\n');
    out.push_str(&render_hot_locks(&report.hot_locks));
    out.push('\n');
    out.push_str(&render_deadlocks(&report.deadlocks, &report.blocking_chains));
    out.push('\n');
    out.push_str(&render_summary(&report.summary));
    out
}

pub fn render_contention(reports: &[LockContentionReport]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "🔥 Top contended locks ({})", reports.len());
    if reports.is_empty() {
        let _ = writeln!(out, "   no contention observed");
        return out;
    }
    let _ = writeln!(
        out,
        "{:<24} {:>8} {:>12} {:>10} {:>8} {:>10} {:>6}",
        "LOCK", "BLOCKS", "BLOCKED MS", "MAX MS", "WAITERS", "SEVERITY", "RATIO"
    );
    for report in reports {
        let record = &report.record;
        let _ = writeln!(
            out,
            "{:<24} {:>8} {:>12} {:>10} {:>8} {:>10.2} {:>6.2}{}",
            truncate(&record.lock_id, 24),
            record.block_count,
            record.total_blocked_ms,
            record.max_single_block_ms,
            record.unique_waiter_count,
            report.severity_score,
            report.blocked_ratio,
            if report.convoy { "  CONVOY" } else { "" }
        );
        if let Some(owner) = record.main_owner_id {
            let _ = writeln!(
                out,
                "    main owner {} {} ({} of {} blocks)",
                owner,
                record.main_owner_name.as_deref().unwrap_or("?"),
                record.max_ownership,
                record.block_count
            );
        }
        if let Some(stack) = record.blocking_stacks.first() {
            let _ = writeln!(
                out,
                "    hottest stack ({}x): {}",
                stack.count,
                stack.stack.top().unwrap_or("<no frames>")
            );
        }
    }
    out
}

pub fn render_records(records: &[ContentionRecord]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<24} {:>8} {:>12} {:>8} {:>10}", "LOCK", "BLOCKS", "BLOCKED MS", "WAITERS", "SEVERITY");
    for record in records {
        let _ = writeln!(
            out,
            "{:<24} {:>8} {:>12} {:>8} {:>10.2}{}",
            truncate(&record.lock_id, 24),
            record.block_count,
            record.total_blocked_ms,
            record.unique_waiter_count,
            record.severity_score,
            if record.convoy { "  CONVOY" } else { "" }
        );
    }
    out
}

pub fn render_hot_locks(records: &[ContentionRecord]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "🌡  Hot locks ({})", records.len());
    for record in records {
        let Some(hot) = &record.hot else { continue };
        let _ = writeln!(
            out,
            "   {:<24} ratio {:>6.2} over {} ms, {} waiters",
            truncate(&record.lock_id, 24),
            hot.normalized_blocked_ratio,
            hot.observation_window_ms,
            record.unique_waiter_count
        );
    }

    let wave = LockHotnessWave::from_records(records);
    if !wave.components().is_empty() {
        let xs: Vec<f64> = (0..WAVE_SAMPLES).map(|i| i as f64 * 0.1).collect();
        let _ = writeln!(
            out,
            "   hotness wave: max {:.2}, avg {:.2}, variance {:.2}, longest streak above 1.0: {}",
            wave.max(&xs),
            wave.average(&xs),
            wave.variance(&xs),
            wave.hot_streak(&xs, 1.0)
        );
    }
    out
}

pub fn render_deadlocks(deadlocks: &[Deadlock], chains: &[Vec<ThreadId>]) -> String {
    let mut out = String::new();
    if deadlocks.is_empty() {
        let _ = writeln!(out, "✅ No deadlocks detected");
    } else {
        let _ = writeln!(out, "💀 Deadlocks ({})", deadlocks.len());
        for deadlock in deadlocks {
            let _ = writeln!(
                out,
                "   {} (waited {} ms)",
                join_threads(&deadlock.threads),
                deadlock.total_wait_ms
            );
        }
    }
    if !chains.is_empty() {
        let _ = writeln!(out, "⛓  Blocking chains ({})", chains.len());
        for chain in chains {
            let _ = writeln!(out, "   {}", join_threads(chain));
        }
    }
    out
}

pub fn render_summary(summary: &ContentionSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "📊 Summary");
    let _ = writeln!(
        out,
        "   threads {} ({} blocked), locks {} ({} contended)",
        summary.total_threads, summary.blocked_threads, summary.total_locks, summary.contended_locks
    );
    let _ = writeln!(
        out,
        "   {} block events, {} ms blocked in total",
        summary.total_block_events, summary.total_blocked_ms
    );
    if !summary.top_hot_threads.is_empty() {
        let _ = writeln!(out, "{:<8} {:<24} {:>12} {:>8}", "THREAD", "NAME", "BLOCKED MS", "BLOCKS");
        for thread in &summary.top_hot_threads {
            let _ = writeln!(
                out,
                "{:<8} {:<24} {:>12} {:>8}",
                thread.thread_id,
                truncate(&thread.thread_name, 24),
                thread.total_blocked_ms,
                thread.block_count
            );
        }
    }
    out
}

fn join_threads(threads: &[ThreadId]) -> String {
    threads
        .iter()
        .map(ThreadId::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn truncate(value: &str, width: usize) -> String {
    if value.chars().count() <= width {
        value.to_string()
    } else {
        let mut truncated: String = value.chars().take(width.saturating_sub(1)).collect();
        truncated.push('…');
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_identifiers() {
        assert_eq!(truncate("short", 8), "short");
        assert_eq!(truncate("java.util.concurrent.locks", 8).chars().count(), 8);
    }

    #[test]
    fn deadlocks_render_as_arrows() {
        let deadlocks = vec![Deadlock {
            threads: vec![1, 2],
            total_wait_ms: 30,
        }];
        let out = render_deadlocks(&deadlocks, &[vec![3, 1]]);
        assert!(out.contains("1 -> 2 (waited 30 ms)"));
        assert!(out.contains("3 -> 1"));
    }

    #[test]
    fn empty_contention_is_reported() {
        assert!(render_contention(&[]).contains("no contention observed"));
        assert!(render_deadlocks(&[], &[]).contains("No deadlocks"));
    }
}
