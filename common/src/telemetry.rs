use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{config::EventMap, driver::WorkloadReply};

/// Marker prefixing the totals/summary line in textual driver output.
pub const TOTALS_MARKER: &str = "Total";
/// Marker prefixing the device polling stats line.
pub const POLL_STATS_MARKER: &str = "poll stats:";
/// Marker prefixing the completions-per-poll histogram.
pub const CPL_HIST_MARKER: &str = "completions per poll:";

/// Captured trial output, exactly as the external tools emitted it.
#[derive(Debug, Clone)]
pub struct RawMeasurement {
    pub driver_output: String,
    pub sampler_output: Option<String>,
    /// Auxiliary per-operation timing breakdown, when the instrumented
    /// driver produced one.
    pub stage_table: Option<PathBuf>,
}

/// Typed fields extracted from a [`RawMeasurement`]. Every field a raw
/// stream did not report is zero; that is a documented degradation, not
/// an error.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedCounters {
    pub iops: f64,
    pub p50_us: f64,
    pub p99_us: f64,
    pub p999_us: f64,
    pub cycles: f64,
    pub instructions: f64,
    pub llc_misses: f64,
    pub dram_reads: f64,
    pub dram_writes: f64,
    pub energy_joules: f64,
    pub polls: f64,
    pub completions: f64,
    pub sq_doorbells: f64,
    pub cq_doorbells: f64,
    /// Completions-per-poll histogram, preserved verbatim for storage.
    pub cpl_hist: String,
    pub stages: StageTimings,
}

/// Per-operation nanosecond averages from the auxiliary timing table.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageTimings {
    pub submit_preamble: f64,
    pub tracker_alloc: f64,
    pub addr_xlate: f64,
    pub cmd_construct: f64,
    pub fence: f64,
    pub doorbell: f64,
    pub polling_wait: f64,
    pub cqe_detect: f64,
    pub tracker_lookup: f64,
    pub state_dealloc: f64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct TotalsLine {
    pub iops: f64,
    pub avg_us: f64,
    pub min_us: f64,
    pub max_us: f64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Percentiles {
    pub p50_us: f64,
    pub p99_us: f64,
    pub p999_us: f64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct HwCounters {
    pub cycles: f64,
    pub instructions: f64,
    pub llc_misses: f64,
    pub dram_reads: f64,
    pub dram_writes: f64,
    pub energy_joules: f64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct PollStats {
    pub polls: f64,
    pub completions: f64,
    pub sq_doorbells: f64,
    pub cq_doorbells: f64,
}

/// Assembles [`ParsedCounters`] from a raw measurement and the driver's
/// typed reply. Each extraction rule is independent and order-insensitive
/// over the raw text.
pub fn collect(raw: &RawMeasurement, reply: &WorkloadReply, events: &EventMap) -> ParsedCounters {
    let hw = raw
        .sampler_output
        .as_deref()
        .map(|report| parse_counter_report(report, events))
        .unwrap_or_default();
    let polls = parse_poll_stats(&raw.driver_output, POLL_STATS_MARKER);
    let stages = raw
        .stage_table
        .as_deref()
        .map(stage_table)
        .unwrap_or_default();

    ParsedCounters {
        iops: reply.iops,
        p50_us: reply.p50_us,
        p99_us: reply.p99_us,
        p999_us: reply.p999_us,
        cycles: hw.cycles,
        instructions: hw.instructions,
        llc_misses: hw.llc_misses,
        dram_reads: hw.dram_reads,
        dram_writes: hw.dram_writes,
        energy_joules: hw.energy_joules,
        polls: polls.polls,
        completions: polls.completions,
        sq_doorbells: polls.sq_doorbells,
        cq_doorbells: polls.cq_doorbells,
        cpl_hist: parse_cpl_hist(&raw.driver_output, CPL_HIST_MARKER),
        stages,
    }
}

/// Finds the totals/summary line and reads the values adjacent to the
/// marker. Samplers and drivers may print one line per interval, so the
/// last match is authoritative.
pub fn totals_line(output: &str, marker: &str) -> Option<TotalsLine> {
    let mut found = None;
    for line in output.lines() {
        let trimmed = line.trim_start();
        if !trimmed.starts_with(marker) {
            continue;
        }
        let rest = trimmed[marker.len()..].trim_start();
        let rest = rest.strip_prefix(':').unwrap_or(rest);
        let values: Vec<f64> = rest
            .split_whitespace()
            .filter_map(|word| word.parse().ok())
            .collect();
        if let Some(&iops) = values.first() {
            // layout: IOPS, MiB/s, average, min, max
            found = Some(TotalsLine {
                iops,
                avg_us: values.get(2).copied().unwrap_or(0.0),
                min_us: values.get(3).copied().unwrap_or(0.0),
                max_us: values.get(4).copied().unwrap_or(0.0),
            });
        }
    }
    found
}

static PERCENTILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*([0-9]+(?:\.[0-9]+)?)\s*%\s*:?\s*([0-9]+(?:\.[0-9]+)?)\s*us").unwrap()
});

/// Reads latency percentile lines of the form `<pct>%: <value>us`. Only
/// the exact keys 50.0, 99.0 and 99.9 are kept; any other reported
/// percentile is ignored. Absent keys stay zero.
pub fn parse_percentiles(output: &str) -> Percentiles {
    let mut p = Percentiles::default();
    for cap in PERCENTILE_RE.captures_iter(output) {
        let (Ok(key), Ok(value)) = (cap[1].parse::<f64>(), cap[2].parse::<f64>()) else {
            continue;
        };
        if key == 50.0 {
            p.p50_us = value;
        } else if key == 99.0 {
            p.p99_us = value;
        } else if key == 99.9 {
            p.p999_us = value;
        }
    }
    p
}

/// Reads a delimited counter report, one `value<d>unit<d>event` line per
/// event with `;` or `,` as the delimiter. An `<not supported>` (or
/// `<not counted>`) sentinel maps to zero. Last match per event wins.
pub fn parse_counter_report(report: &str, events: &EventMap) -> HwCounters {
    let mut hw = HwCounters::default();
    for line in report.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let delim = if line.contains(';') { ';' } else { ',' };
        let fields: Vec<&str> = line.split(delim).map(str::trim).collect();
        if fields.len() < 3 {
            continue;
        }
        let value = counter_value(fields[0]);
        let event = fields[2];
        if event == events.cycles {
            hw.cycles = value;
        } else if event == events.instructions {
            hw.instructions = value;
        } else if event == events.llc_misses {
            hw.llc_misses = value;
        } else if event == events.dram_reads {
            hw.dram_reads = value;
        } else if event == events.dram_writes {
            hw.dram_writes = value;
        } else if event == events.energy {
            hw.energy_joules = value;
        }
    }
    hw
}

fn counter_value(field: &str) -> f64 {
    if field.starts_with("<not") {
        return 0.0;
    }
    field.replace(',', "").parse().unwrap_or(0.0)
}

/// Reads `key=value` pairs from the device polling stats line. An absent
/// line leaves every stat at zero.
pub fn parse_poll_stats(output: &str, marker: &str) -> PollStats {
    let mut stats = PollStats::default();
    for line in output.lines() {
        let Some(idx) = line.find(marker) else {
            continue;
        };
        for pair in line[idx + marker.len()..].split_whitespace() {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let Ok(value) = value.parse::<f64>() else {
                continue;
            };
            match key {
                "polls" => stats.polls = value,
                "completions" => stats.completions = value,
                "sq_doorbells" => stats.sq_doorbells = value,
                "cq_doorbells" => stats.cq_doorbells = value,
                _ => {}
            }
        }
    }
    stats
}

/// Preserves the free-form completions-per-poll histogram verbatim; the
/// dataset stores it undecomposed.
pub fn parse_cpl_hist(output: &str, marker: &str) -> String {
    output
        .lines()
        .filter_map(|line| line.find(marker).map(|idx| line[idx + marker.len()..].trim()))
        .next_back()
        .unwrap_or("")
        .to_owned()
}

/// Averages the named nanosecond columns of the auxiliary timing table.
/// A missing file, missing column or zero rows yields zero timings.
pub fn stage_table(path: &Path) -> StageTimings {
    let Ok(mut reader) = csv::Reader::from_path(path) else {
        return StageTimings::default();
    };
    let Ok(headers) = reader.headers() else {
        return StageTimings::default();
    };
    let names: Vec<String> = headers
        .iter()
        .map(|h| h.trim().to_ascii_lowercase())
        .collect();

    let mut sums = vec![0f64; names.len()];
    let mut rows = 0u64;
    for record in reader.records() {
        let Ok(record) = record else {
            continue;
        };
        for (i, field) in record.iter().enumerate().take(sums.len()) {
            if let Ok(value) = field.trim().parse::<f64>() {
                sums[i] += value;
            }
        }
        rows += 1;
    }
    if rows == 0 {
        return StageTimings::default();
    }

    let avg = |name: &str| {
        names
            .iter()
            .position(|n| n == name)
            .map(|i| sums[i] / rows as f64)
            .unwrap_or(0.0)
    };
    StageTimings {
        submit_preamble: avg("submit_preamble_ns"),
        tracker_alloc: avg("tracker_alloc_ns"),
        addr_xlate: avg("addr_xlate_ns"),
        cmd_construct: avg("cmd_construct_ns"),
        fence: avg("fence_ns"),
        doorbell: avg("doorbell_ns"),
        polling_wait: avg("polling_wait_ns"),
        cqe_detect: avg("cqe_detect_ns"),
        tracker_lookup: avg("tracker_lookup_ns"),
        state_dealloc: avg("state_dealloc_ns"),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn totals_line_reads_adjacent_values() {
        let output = "Device Information : IOPS MiB/s Average min max\n\
                      PCIE (0000:00:04.0) NSID 1 from core 0: 101.00 0.39 100.00 50.00 200.00\n\
                      ========================================================\n\
                      Total : 123456.78 482.25 103.69 55.00 4201.79\n";
        let totals = totals_line(output, TOTALS_MARKER).unwrap();
        assert_eq!(totals.iops, 123456.78);
        assert_eq!(totals.avg_us, 103.69);
        assert_eq!(totals.min_us, 55.00);
        assert_eq!(totals.max_us, 4201.79);
    }

    #[test]
    fn totals_last_match_wins() {
        let output = "Total : 10.0 0.1 1.0 1.0 1.0\nTotal : 20.0 0.2 2.0 2.0 2.0\n";
        assert_eq!(totals_line(output, TOTALS_MARKER).unwrap().iops, 20.0);
    }

    #[test]
    fn totals_absent_is_none() {
        assert!(totals_line("no summary here\n", TOTALS_MARKER).is_none());
    }

    #[test]
    fn percentiles_with_exact_keys() {
        let output = "latency summary:\n 50.00000%   12.3us\n 99.00000%   45.6us\n";
        let p = parse_percentiles(output);
        assert_eq!(p.p50_us, 12.3);
        assert_eq!(p.p99_us, 45.6);
        assert_eq!(p.p999_us, 0.0);
    }

    #[test]
    fn other_percentile_keys_are_ignored() {
        let output = " 25.00000%: 1.0us\n 50.00000%: 2.0us\n 99.90000%: 3.0us\n 99.99000%: 4.0us\n";
        let p = parse_percentiles(output);
        assert_eq!(p.p50_us, 2.0);
        assert_eq!(p.p99_us, 0.0);
        assert_eq!(p.p999_us, 3.0);
    }

    #[test]
    fn counter_report_by_event_name() {
        let events = EventMap::default();
        let report = "123456;;cycles\n789;;instructions\n<not supported>;;LLC-load-misses\n";
        let hw = parse_counter_report(report, &events);
        assert_eq!(hw.cycles, 123456.0);
        assert_eq!(hw.instructions, 789.0);
        assert_eq!(hw.llc_misses, 0.0);
    }

    #[test]
    fn counter_report_last_match_wins() {
        let events = EventMap::default();
        let report = "100;;cycles\n200;;cycles\n";
        assert_eq!(parse_counter_report(report, &events).cycles, 200.0);
    }

    #[test]
    fn counter_report_comma_delimited() {
        let events = EventMap::default();
        let report = "3.14,Joules,power/energy-pkg/\n512,MiB,uncore_imc/cas_count_read/\n";
        let hw = parse_counter_report(report, &events);
        assert_eq!(hw.energy_joules, 3.14);
        assert_eq!(hw.dram_reads, 512.0);
    }

    #[test]
    fn counter_report_skips_malformed_lines() {
        let events = EventMap::default();
        let report = "# started on Thu Aug 7\n\ngarbage\n42;;cycles\n";
        assert_eq!(parse_counter_report(report, &events).cycles, 42.0);
    }

    #[test]
    fn poll_stats_from_marker_line() {
        let output =
            "poll stats: polls=8000 completions=4000 sq_doorbells=200 cq_doorbells=100\n";
        let stats = parse_poll_stats(output, POLL_STATS_MARKER);
        assert_eq!(stats.polls, 8000.0);
        assert_eq!(stats.completions, 4000.0);
        assert_eq!(stats.sq_doorbells, 200.0);
        assert_eq!(stats.cq_doorbells, 100.0);
    }

    #[test]
    fn poll_stats_absent_line_is_all_zero() {
        assert_eq!(
            parse_poll_stats("Total : 1.0\n", POLL_STATS_MARKER),
            PollStats::default()
        );
    }

    #[test]
    fn histogram_is_kept_verbatim() {
        let output = "completions per poll: 0:123, 1:456, 32+:7\n";
        assert_eq!(
            parse_cpl_hist(output, CPL_HIST_MARKER),
            "0:123, 1:456, 32+:7"
        );
        assert_eq!(parse_cpl_hist("nothing\n", CPL_HIST_MARKER), "");
    }

    #[test]
    fn stage_table_averages_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stages.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "submit_preamble_ns,fence_ns,doorbell_ns").unwrap();
        writeln!(file, "10,4,30").unwrap();
        writeln!(file, "20,8,50").unwrap();
        drop(file);

        let stages = stage_table(&path);
        assert_eq!(stages.submit_preamble, 15.0);
        assert_eq!(stages.fence, 6.0);
        assert_eq!(stages.doorbell, 40.0);
        // columns the table does not carry stay zero
        assert_eq!(stages.tracker_lookup, 0.0);
    }

    #[test]
    fn stage_table_missing_file_is_zero() {
        assert_eq!(
            stage_table(Path::new("/nonexistent/stages.csv")),
            StageTimings::default()
        );
    }

    #[test]
    fn collect_combines_independent_rules() {
        let raw = RawMeasurement {
            driver_output: "Total : 1000.0 3.9 10.0 1.0 100.0\n\
                            poll stats: polls=50 completions=100 sq_doorbells=10 cq_doorbells=5\n\
                            completions per poll: 0:1, 1:2\n"
                .to_owned(),
            sampler_output: Some("500;;cycles\n".to_owned()),
            stage_table: None,
        };
        let reply = WorkloadReply {
            iops: 1000.0,
            p50_us: 9.0,
            ..Default::default()
        };
        let counters = collect(&raw, &reply, &EventMap::default());
        assert_eq!(counters.iops, 1000.0);
        assert_eq!(counters.p50_us, 9.0);
        assert_eq!(counters.cycles, 500.0);
        assert_eq!(counters.polls, 50.0);
        assert_eq!(counters.cpl_hist, "0:1, 1:2");
        assert_eq!(counters.stages, StageTimings::default());
    }
}
