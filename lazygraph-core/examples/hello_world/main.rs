use lazygraph_core::{creator, io, traversal, ElementType, Executor};

fn main() {
    let x = creator::input(&[3, 4], ElementType::F32).unwrap();
    x.set_name("x");
    let a = creator::scalar(2.0f32).unwrap();
    let b = creator::scalar(3.0f32).unwrap();
    let res = &x * &a + b;
    let out = res.mean(&[1]);
    out.set_name("out");

    x.write_map(&[1.0f32; 12]).unwrap();
    dbg!(out.read_map::<f32>().unwrap());

    // New values, same shape: the plan built above is re-run as is.
    x.write_map(&[2.0f32; 12]).unwrap();
    assert_eq!(out.read_map::<f32>().unwrap(), vec![7.0; 3]);

    // New shape: the plan is re-lowered.
    x.resize(&[5, 4]).unwrap();
    x.write_map(&[1.0f32; 20]).unwrap();
    assert_eq!(out.read_map::<f32>().unwrap(), vec![5.0; 5]);

    println!("{}", traversal::to_dot(&[out.clone()]));
    if let Err(e) = traversal::visualize(&[out.clone()], "graph.png") {
        eprintln!("skipping graph.png: {e}");
    }

    let bytes = io::save_to_bytes(&[out]).unwrap();
    println!("saved graph: {} bytes", bytes.len());
    Executor::global().dump_profile();
}
