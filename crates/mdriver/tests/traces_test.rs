#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]
#![cfg(test)]

use std::{fs, path::PathBuf};

use mdriver::{
    replay::{self, ReplayConfig},
    trace::Trace,
};

fn bundled_traces() -> Vec<PathBuf> {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("traces");
    let mut paths = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "rep"))
        .collect::<Vec<_>>();
    paths.sort();
    paths
}

#[test]
fn replay_bundled_traces_with_checks() {
    let paths = bundled_traces();
    assert!(paths.len() >= 6);

    let config = ReplayConfig {
        check: true,
        ..ReplayConfig::default()
    };
    for path in &paths {
        let trace = Trace::load(path).unwrap();
        let stats = replay::replay(&trace, &config)
            .unwrap_or_else(|err| panic!("{}: {err}", path.display()));
        assert_eq!(stats.ops, trace.steps().len(), "{}", path.display());
        assert!(stats.utilization() > 0.0, "{}", path.display());
        assert!(stats.utilization() <= 1.0, "{}", path.display());
    }
}

#[test]
fn bundled_traces_release_everything() {
    for path in bundled_traces() {
        let trace = Trace::load(&path).unwrap();
        let mut replayer = replay::Replayer::new(&ReplayConfig::default()).unwrap();
        replayer.run(&trace).unwrap();
        assert_eq!(replayer.live_ids().count(), 0, "{}", path.display());

        let heap = replayer.heap();
        heap.check_heap().unwrap();
        let stats = heap.stats();
        assert_eq!(stats.allocated_blocks, 0, "{}", path.display());
        assert_eq!(stats.free_blocks, 1, "{}", path.display());
    }
}
