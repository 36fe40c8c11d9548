mod common;

use common::{counting_executor, single_threaded};
use lazygraph_core::{creator, ElementType, Error, ExecutorScope};

#[test]
fn set_info_dirty_is_idempotent() {
    let (exec, counts) = counting_executor(single_threaded());
    let _scope = ExecutorScope::new(exec);

    let x = creator::input(&[3], ElementType::F32).unwrap();
    let y = x.sqrt();
    x.write_map(&[1.0f32, 4.0, 9.0]).unwrap();
    assert_eq!(y.read_map::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);
    assert_eq!(counts.infos.get(), 1);

    let (node, _) = y.expr();
    let version = node.version();
    assert!(node.set_info_dirty());
    assert!(!node.set_info_dirty());
    assert_eq!(node.version(), version + 1);
    assert!(node.info_dirty());

    assert_eq!(y.read_map::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);
    assert_eq!(counts.infos.get(), 2);
    assert_eq!(counts.builds.get(), 2);
    assert_eq!(counts.runs.get(), 2);
}

#[test]
fn resize_propagates_through_chain() {
    let (exec, _counts) = counting_executor(single_threaded());
    let _scope = ExecutorScope::new(exec);

    let a = creator::input(&[2, 3], ElementType::F32).unwrap();
    let b = &a + &a;
    let c = b.sum(&[1]);
    a.write_map(&[1.0f32; 6]).unwrap();
    assert_eq!(c.read_map::<f32>().unwrap(), vec![6.0, 6.0]);

    a.resize(&[4, 3]).unwrap();
    assert!(b.expr().0.info_dirty());
    assert!(c.expr().0.info_dirty());
    assert!(a.expr().0.content_dirty());
    assert_eq!(c.get_info().unwrap().dims, vec![4]);
    assert!(matches!(c.read_map::<f32>(), Err(Error::NotReady(_))));

    let values: Vec<f32> = (0..12).map(|i| i as f32).collect();
    a.write_map(&values).unwrap();
    assert_eq!(c.read_map::<f32>().unwrap(), vec![6.0, 24.0, 42.0, 60.0]);
}

#[test]
fn resize_to_same_dims_is_a_no_op() {
    let a = creator::input(&[2], ElementType::F32).unwrap();
    let b = -&a;
    a.write_map(&[1.0f32, 2.0]).unwrap();
    assert_eq!(b.read_map::<f32>().unwrap(), vec![-1.0, -2.0]);
    let version = a.expr().0.version();
    a.resize(&[2]).unwrap();
    assert_eq!(a.expr().0.version(), version);
    assert!(!b.expr().0.info_dirty());
}

#[test]
fn unknown_extent_resolves_after_resize() {
    let x = creator::input(&[-1, 2], ElementType::F32).unwrap();
    let y = -&x;
    assert!(matches!(y.get_info(), Err(Error::ShapeUnresolved { .. })));
    assert!(y.expr().0.is_valid());

    x.resize(&[3, 2]).unwrap();
    x.write_map(&[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    assert_eq!(y.get_info().unwrap().dims, vec![3, 2]);
    assert_eq!(
        y.read_map::<f32>().unwrap(),
        vec![-1.0, -2.0, -3.0, -4.0, -5.0, -6.0]
    );
}

#[test]
fn resize_rejects_non_inputs_and_empty_shapes() {
    let k = creator::constant(&[1.0f32, 2.0], &[2]).unwrap();
    assert!(matches!(
        k.resize(&[3]),
        Err(Error::IllegalMutation { .. })
    ));
    let x = creator::input(&[2], ElementType::F32).unwrap();
    assert!(matches!(
        x.resize(&[0, 2]),
        Err(Error::IllegalMutation { .. })
    ));
    assert!(matches!(
        x.resize(&[i32::MAX, i32::MAX, i32::MAX]),
        Err(Error::IllegalMutation { .. })
    ));
    assert_eq!(x.get_info().unwrap().dims, vec![2]);
}

#[test]
fn reshape_follows_shape_content() {
    let x = creator::constant(&[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
    let dims = creator::input(&[2], ElementType::I32).unwrap();
    let r = creator::reshape(&x, &dims);
    let tail = r.sum(&[1]);

    dims.write_map(&[3i32, 2]).unwrap();
    assert_eq!(r.get_info().unwrap().dims, vec![3, 2]);
    assert_eq!(tail.read_map::<f32>().unwrap(), vec![3.0, 7.0, 11.0]);

    dims.write_map(&[6i32, 1]).unwrap();
    assert!(r.expr().0.info_dirty());
    assert!(tail.expr().0.info_dirty());
    assert_eq!(r.get_info().unwrap().dims, vec![6, 1]);
    assert_eq!(
        tail.read_map::<f32>().unwrap(),
        vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
    );
}

#[test]
fn shape_reads_only_extents() {
    let x = creator::input(&[2, 3], ElementType::F32).unwrap();
    let s = creator::shape(&x);
    // `x` holds no content yet; its extents suffice.
    assert!(x.expr().0.content_dirty());
    assert_eq!(s.read_map::<i32>().unwrap(), vec![2, 3]);
}
