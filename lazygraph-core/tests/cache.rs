mod common;

use common::{counting_executor, single_threaded};
use lazygraph_core::{creator, ElementType, ExecutorScope, Expr, GcFlag, Var};

#[test]
fn content_change_reuses_plan() {
    let (exec, counts) = counting_executor(single_threaded());
    let _scope = ExecutorScope::new(exec);

    let x = creator::input(&[3], ElementType::F32).unwrap();
    let y = x.sqrt() * creator::scalar(2.0f32).unwrap();
    x.write_map(&[1.0f32, 4.0, 9.0]).unwrap();
    assert_eq!(y.read_map::<f32>().unwrap(), vec![2.0, 4.0, 6.0]);
    assert_eq!((counts.builds.get(), counts.runs.get()), (1, 1));

    // Clean reads do not run anything.
    assert_eq!(y.read_map::<f32>().unwrap(), vec![2.0, 4.0, 6.0]);
    assert_eq!(counts.runs.get(), 1);

    x.write_map(&[16.0f32, 25.0, 36.0]).unwrap();
    assert_eq!(y.read_map::<f32>().unwrap(), vec![8.0, 10.0, 12.0]);
    assert_eq!((counts.builds.get(), counts.runs.get()), (1, 2));

    x.resize(&[2]).unwrap();
    x.write_map(&[1.0f32, 1.0]).unwrap();
    assert_eq!(y.read_map::<f32>().unwrap(), vec![2.0, 2.0]);
    assert_eq!((counts.builds.get(), counts.runs.get()), (2, 3));
}

#[test]
fn downstream_cache_sees_upstream_rerun() {
    let (exec, counts) = counting_executor(single_threaded());
    let _scope = ExecutorScope::new(exec.clone());

    let a = creator::input(&[2], ElementType::F32).unwrap();
    let b = -&a;
    a.write_map(&[1.0f32, 2.0]).unwrap();
    assert_eq!(b.read_map::<f32>().unwrap(), vec![-1.0, -2.0]);

    // Built after `b` has its own cache, so `c` depends on it.
    let c = &b + &b;
    assert_eq!(c.read_map::<f32>().unwrap(), vec![-2.0, -4.0]);
    assert_eq!(exec.cache_count(), 2);
    assert_eq!(counts.builds.get(), 2);

    a.write_map(&[3.0f32, 4.0]).unwrap();
    assert_eq!(c.read_map::<f32>().unwrap(), vec![-6.0, -8.0]);
    assert_eq!(counts.builds.get(), 2);
}

#[test]
fn prepare_compute_shares_one_cache() {
    let (exec, counts) = counting_executor(single_threaded());
    let _scope = ExecutorScope::new(exec.clone());

    let x = creator::constant(&[1.0f32, 2.0, 3.0, 4.0], &[4]).unwrap();
    let p = &x + &x;
    let q = &x * &x;
    Var::prepare_compute(&[p.clone(), q.clone()], false).unwrap();
    assert_eq!(exec.cache_count(), 1);

    assert_eq!(p.read_map::<f32>().unwrap(), vec![2.0, 4.0, 6.0, 8.0]);
    assert_eq!(q.read_map::<f32>().unwrap(), vec![1.0, 4.0, 9.0, 16.0]);
    assert_eq!((counts.builds.get(), counts.runs.get()), (1, 1));
}

#[test]
fn gc_part_keeps_retained_plans_gc_full_drops_them() {
    let (exec, counts) = counting_executor(single_threaded());
    let _scope = ExecutorScope::new(exec.clone());

    let x = creator::input(&[2], ElementType::F32).unwrap();
    let y = -&x;
    x.write_map(&[1.0f32, 2.0]).unwrap();
    assert_eq!(y.read_map::<f32>().unwrap(), vec![-1.0, -2.0]);

    exec.gc(GcFlag::Part);
    assert_eq!(y.read_map::<f32>().unwrap(), vec![-1.0, -2.0]);
    assert_eq!((counts.builds.get(), counts.runs.get()), (1, 1));

    // The retained plan re-runs in place after a content change.
    x.write_map(&[3.0f32, 4.0]).unwrap();
    assert_eq!(y.read_map::<f32>().unwrap(), vec![-3.0, -4.0]);
    assert_eq!((counts.builds.get(), counts.runs.get()), (1, 2));

    exec.gc(GcFlag::Full);
    assert_eq!(y.read_map::<f32>().unwrap(), vec![-3.0, -4.0]);
    assert_eq!((counts.builds.get(), counts.runs.get()), (2, 3));
}

#[test]
fn gc_part_releases_detached_caches() {
    let (exec, counts) = counting_executor(single_threaded());
    let _scope = ExecutorScope::new(exec.clone());

    let x = creator::constant(&[4.0f32, 9.0], &[2]).unwrap();
    let y = -&x;
    assert_eq!(y.read_map::<f32>().unwrap(), vec![-4.0, -9.0]);
    let detached = y.expr().0.cache().unwrap();

    let r = x.sqrt();
    Expr::replace(y.expr().0, r.expr().0).unwrap();
    assert!(!detached.is_content_dirty());
    exec.gc(GcFlag::Part);
    assert!(detached.is_content_dirty());
    assert_eq!(y.read_map::<f32>().unwrap(), vec![2.0, 3.0]);
    assert_eq!(counts.builds.get(), 2);
}

#[test]
fn dropped_graph_releases_its_cache() {
    let (exec, _counts) = counting_executor(single_threaded());
    let _scope = ExecutorScope::new(exec.clone());
    {
        let x = creator::constant(&[1.0f32], &[1]).unwrap();
        let y = -&x;
        y.read_map::<f32>().unwrap();
        assert_eq!(exec.cache_count(), 1);
    }
    assert_eq!(exec.cache_count(), 0);
}

#[test]
fn profiling_records_operator_kinds() {
    let (exec, _counts) = counting_executor(single_threaded().with_profiling(true));
    let _scope = ExecutorScope::new(exec.clone());

    let a = creator::constant(&[1.0f32, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
    let b = creator::constant(&[1.0f32, 0.0, 0.0, 1.0], &[2, 2]).unwrap();
    let c = a.matmul(&b) + creator::scalar(1.0f32).unwrap();
    assert_eq!(c.read_map::<f32>().unwrap(), vec![2.0, 3.0, 4.0, 5.0]);

    let profile = exec.profile();
    let kinds: Vec<&str> = profile.iter().map(|(k, _)| k.as_str()).collect();
    assert!(kinds.contains(&"MatMul"));
    assert!(kinds.contains(&"BinaryOp"));
    let (_, mm) = profile.iter().find(|(k, _)| k == "MatMul").unwrap();
    assert_eq!(mm.count, 1);
    assert_eq!(mm.flops, 16.0);

    exec.reset_profile();
    assert!(exec.profile().is_empty());
}
