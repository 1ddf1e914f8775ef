use eyre::Result;
use itertools::iproduct;
use serde::{Deserialize, Serialize};

use crate::{
    config::{CoreAxis, SweepAxes},
    util::{auto_select_cores, parse_request_size},
};

/// One point of the sweep's parameter space. Immutable once enumerated;
/// `run` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepPoint {
    pub io_size: u64,
    pub queue_depth: u32,
    pub qpairs: u32,
    pub cores: Vec<u32>,
    pub run: u32,
}

impl SweepPoint {
    /// Directory tag for the trial's retained artifacts.
    pub fn tag(&self) -> String {
        format!(
            "s{}_q{}_p{}_c{}_r{}",
            self.io_size,
            self.queue_depth,
            self.qpairs,
            self.cores.len(),
            self.run
        )
    }

    pub fn coordinates(&self) -> String {
        format!(
            "io_size={} qd={} qpairs={} cores={:?} run={}",
            self.io_size, self.queue_depth, self.qpairs, self.cores, self.run
        )
    }
}

/// Expands the configured axes into the full Cartesian product, nesting
/// io_size, then queue depth, then core assignment, then qpairs, with the
/// repeat index innermost. The order is load-bearing: dataset rows appear
/// in exactly this order and partially-completed sweeps resume against it.
pub fn enumerate(axes: &SweepAxes) -> Result<Vec<SweepPoint>> {
    let io_sizes = axes
        .io_sizes
        .iter()
        .map(|s| parse_request_size(s))
        .collect::<Result<Vec<_>>>()?;
    let assignments = match &axes.cores {
        CoreAxis::Ids(ids) => ids.clone(),
        CoreAxis::Counts(counts) => counts
            .iter()
            .map(|count| auto_select_cores(*count))
            .collect::<Result<Vec<_>>>()?,
    };
    let qpairs = axes.qpairs.clone().unwrap_or_else(|| vec![1]);

    Ok(iproduct!(
        io_sizes.into_iter(),
        axes.queue_depths.iter().copied(),
        assignments.into_iter(),
        qpairs.into_iter(),
        1..=axes.repeats
    )
    .map(|(io_size, queue_depth, cores, qpairs, run)| SweepPoint {
        io_size,
        queue_depth,
        qpairs,
        cores,
        run,
    })
    .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axes(io_sizes: &[&str], queue_depths: &[u32], repeats: u32) -> SweepAxes {
        SweepAxes {
            io_sizes: io_sizes.iter().map(|s| s.to_string()).collect(),
            queue_depths: queue_depths.to_vec(),
            qpairs: None,
            cores: CoreAxis::Ids(vec![vec![0]]),
            repeats,
        }
    }

    #[test]
    fn enumeration_order_is_deterministic() {
        let points = enumerate(&axes(&["4k", "16k"], &[16, 32], 2)).unwrap();
        let seq: Vec<(u64, u32, u32)> = points
            .iter()
            .map(|p| (p.io_size, p.queue_depth, p.run))
            .collect();
        assert_eq!(
            seq,
            vec![
                (4096, 16, 1),
                (4096, 16, 2),
                (4096, 32, 1),
                (4096, 32, 2),
                (16384, 16, 1),
                (16384, 16, 2),
                (16384, 32, 1),
                (16384, 32, 2),
            ]
        );
    }

    #[test]
    fn core_assignments_nest_outside_qpairs() {
        let mut axes = axes(&["4k"], &[1], 1);
        axes.cores = CoreAxis::Ids(vec![vec![0], vec![0, 1]]);
        axes.qpairs = Some(vec![1, 2]);
        let points = enumerate(&axes).unwrap();
        let seq: Vec<(usize, u32)> = points.iter().map(|p| (p.cores.len(), p.qpairs)).collect();
        assert_eq!(seq, vec![(1, 1), (1, 2), (2, 1), (2, 2)]);
    }

    #[test]
    fn count_axis_auto_selects_from_zero() {
        let mut axes = axes(&["4k"], &[1], 1);
        axes.cores = CoreAxis::Counts(vec![1]);
        let points = enumerate(&axes).unwrap();
        assert_eq!(points[0].cores, vec![0]);
    }

    #[test]
    fn every_point_is_unique() {
        let points = enumerate(&axes(&["4k", "16k"], &[1, 2, 4], 3)).unwrap();
        assert_eq!(points.len(), 18);
        for (i, a) in points.iter().enumerate() {
            assert!(points.iter().skip(i + 1).all(|b| a != b));
        }
    }

    #[test]
    fn tags_encode_the_point() {
        let point = SweepPoint {
            io_size: 4096,
            queue_depth: 16,
            qpairs: 2,
            cores: vec![0, 1],
            run: 3,
        };
        assert_eq!(point.tag(), "s4096_q16_p2_c2_r3");
    }
}
