//! Performance counters: count how many times we do various important operations.

use std::sync::atomic::{AtomicUsize, Ordering, fence};

use enum_map::{Enum, EnumMap};
use lazy_static::lazy_static;
use tracing::*;

#[derive(Debug, Copy, Clone, Enum)]
pub enum Op {
    IndexLoad,
    FileToBuffer,
    FileToMmap,
    DedupHit,
    ChunkCut,
    PackFinalized,
    PackSkippedBlob,
    PackStreamRestart,
    ParentReuse,
    ParentReread,
}

lazy_static! {
    static ref COUNTER_MAP: EnumMap<Op, AtomicUsize> = EnumMap::default();
}

#[inline]
pub fn bump(which: Op) {
    add(which, 1);
}

pub fn add(to: Op, amount: usize) {
    COUNTER_MAP[to].fetch_add(amount, Ordering::Relaxed);
}

pub fn get(which: Op) -> usize {
    COUNTER_MAP[which].load(Ordering::Relaxed)
}

pub fn log_counts() {
    // Called once at program exit; make sure every other thread's writes
    // are visible before we read them back.
    fence(Ordering::SeqCst);

    let counts = COUNTER_MAP
        .iter()
        .map(|(k, v)| (k, v.load(Ordering::Relaxed)))
        .filter(|(_k, v)| *v > 0)
        .collect::<Vec<_>>();

    if counts.is_empty() {
        return;
    }

    let opname = |op| match op {
        Op::IndexLoad => "indexes loaded",
        Op::FileToBuffer => "input files buffered",
        Op::FileToMmap => "input files memory mapped",
        Op::DedupHit => "deduplicated blobs",
        Op::ChunkCut => "chunks cut",
        Op::PackFinalized => "packs finalized",
        Op::PackSkippedBlob => "blobs skipped reading packs",
        Op::PackStreamRestart => "pack read restarts",
        Op::ParentReuse => "nodes reused from parent snapshot",
        Op::ParentReread => "files re-read despite a parent snapshot",
    };

    debug!("Counters:");
    for (op, count) in &counts {
        debug!("{:6} {}", count, opname(*op));
    }
}
