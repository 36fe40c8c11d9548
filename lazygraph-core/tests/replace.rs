use lazygraph_core::{creator, ElementType, Error, Expr, Var, VarKind};

#[test]
fn replace_keeps_consumers() {
    let x = creator::constant(&[4.0f32, 9.0], &[2]).unwrap();
    let y = -&x;
    let z = &y + &y;
    assert_eq!(z.read_map::<f32>().unwrap(), vec![-8.0, -18.0]);

    let r = x.sqrt();
    Expr::replace(y.expr().0, r.expr().0).unwrap();
    assert!(z.expr().0.info_dirty());
    assert_eq!(y.link_number(), 2);
    assert_eq!(x.link_number(), 2);
    assert_eq!(z.read_map::<f32>().unwrap(), vec![4.0, 6.0]);
    assert_eq!(y.read_map::<f32>().unwrap(), vec![2.0, 3.0]);

    drop(r);
    assert_eq!(x.link_number(), 1);
    assert_eq!(x.to_exprs().len(), 1);
}

#[test]
fn replaced_node_follows_resize_while_source_lives() {
    let x = creator::input(&[2], ElementType::F32).unwrap();
    let r = x.sqrt();
    let y = -&x;
    let z = &y + &y;
    Expr::replace(y.expr().0, r.expr().0).unwrap();

    x.resize(&[4]).unwrap();
    assert!(z.expr().0.info_dirty());
    x.write_map(&[1.0f32, 4.0, 9.0, 16.0]).unwrap();
    assert_eq!(z.read_map::<f32>().unwrap(), vec![2.0, 4.0, 6.0, 8.0]);
    assert_eq!(r.read_map::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);

    x.resize(&[2]).unwrap();
    x.write_map(&[4.0f32, 9.0]).unwrap();
    assert_eq!(z.read_map::<f32>().unwrap(), vec![4.0, 6.0]);
    assert_eq!(y.get_info().unwrap().dims, vec![2]);
}

#[test]
fn replace_rejects_cycles() {
    let a = creator::input(&[2], ElementType::F32).unwrap();
    let b = -&a;
    let c = -&b;
    assert!(matches!(
        Expr::replace(b.expr().0, c.expr().0),
        Err(Error::IllegalMutation { .. })
    ));
    assert_eq!(b.link_number(), 1);
}

#[test]
fn dropped_consumers_are_pruned() {
    let x = creator::constant(&[1.0f32, 2.0], &[2]).unwrap();
    {
        let _a = -&x;
        let _b = x.sqrt();
        assert_eq!(x.link_number(), 2);
    }
    assert_eq!(x.link_number(), 0);
    let c = &x * &x;
    assert_eq!(x.link_number(), 2);
    assert_eq!(c.read_map::<f32>().unwrap(), vec![1.0, 4.0]);
}

#[test]
fn replace_with_other_output_count_rewires() {
    let x = creator::constant(&[1.0f32, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
    let parts = creator::split(&x, 0, 2);
    let mut s = x.sqrt();
    let k = -&s;
    assert_eq!(k.get_info().unwrap().dims, vec![2, 2]);

    Var::replace(&mut s, &parts[1]).unwrap();
    assert_eq!(s, parts[1]);
    assert_eq!(k.get_info().unwrap().dims, vec![1, 2]);
    assert_eq!(k.read_map::<f32>().unwrap(), vec![-3.0, -4.0]);
}

#[test]
fn fix_freezes_current_value() {
    let x = creator::constant(&[1.0f32, 2.0], &[2]).unwrap();
    let mut y = &x + &x;
    y.set_name("twice");
    let z = -&y;
    assert_eq!(z.read_map::<f32>().unwrap(), vec![-2.0, -4.0]);

    y.fix(VarKind::Constant).unwrap();
    assert!(y.expr().0.is_leaf());
    assert_eq!(y.kind(), VarKind::Constant);
    assert_eq!(y.name(), "twice");
    assert_eq!(x.link_number(), 0);
    assert_eq!(z.read_map::<f32>().unwrap(), vec![-2.0, -4.0]);
}

#[test]
fn split_outputs_share_one_node() {
    let x = creator::constant(&[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
    let parts = creator::split(&x, 0, 2);
    assert_eq!(parts.len(), 2);
    assert!(std::rc::Rc::ptr_eq(parts[0].expr().0, parts[1].expr().0));
    assert_eq!(parts[1].read_map::<f32>().unwrap(), vec![4.0, 5.0, 6.0]);
    assert_eq!(parts[0].read_map::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);
    assert_eq!(parts[0].get_info().unwrap().dims, vec![1, 3]);
}
