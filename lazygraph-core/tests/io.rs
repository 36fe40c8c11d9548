use lazygraph_core::{creator, io, ElementType, Error, VarKind};

#[test]
fn save_load_round_trip() {
    let x = creator::input(&[2, 2], ElementType::F32).unwrap();
    x.set_name("x");
    let w = creator::constant(&[0.5f32, -1.0, 2.0, 0.25], &[2, 2]).unwrap();
    let y = x.matmul(&w);
    y.set_name("y");
    let z = y.sum(&[1]);
    z.set_name("z");

    let values = [1.5f32, -2.0, 3.25, 0.125];
    x.write_map(&values).unwrap();
    let expected = z.read_map::<f32>().unwrap();

    let bytes = io::save_to_bytes(&[z.clone()]).unwrap();
    let map = io::load_map_from_bytes(&bytes).unwrap();
    assert_eq!(
        map.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["Const2", "x", "y", "z"]
    );

    let (inputs, outputs) = io::get_input_and_output(&map);
    assert_eq!(inputs.keys().collect::<Vec<_>>(), vec!["x"]);
    assert_eq!(outputs.keys().collect::<Vec<_>>(), vec!["z"]);
    assert_eq!(map["Const2"].kind(), VarKind::Constant);

    inputs["x"].write_map(&values).unwrap();
    let loaded = outputs["z"].read_map::<f32>().unwrap();
    assert_eq!(
        loaded.iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
        expected.iter().map(|v| v.to_bits()).collect::<Vec<_>>()
    );
}

#[test]
fn save_names_unnamed_nodes_by_kind() {
    let a = creator::trainable_param(&[1.0f32, 2.0], &[2]).unwrap();
    let parts = creator::split(&a, 0, 2);
    let net = io::save(&parts).unwrap();
    let names: Vec<&str> = net.oplists.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["TrainableParam1", "Split2"]);
    assert_eq!(net.tensor_names, vec!["TrainableParam1", "Split2", "Split21"]);
    assert_eq!(net.oplists[1].input_indexes, vec![0]);
    assert_eq!(net.oplists[1].output_indexes, vec![1, 2]);

    let vars = io::load(&net).unwrap();
    assert_eq!(vars.len(), 3);
    assert_eq!(vars[0].kind(), VarKind::Trainable);
    assert_eq!(vars[2].read_map::<f32>().unwrap(), vec![2.0]);
}

#[test]
fn unknown_batch_loads_as_one() {
    let x = creator::input(&[-1, 3], ElementType::F32).unwrap();
    x.set_name("x");
    let y = -&x;
    let vars = io::load_from_bytes(&io::save_to_bytes(&[y]).unwrap()).unwrap();
    assert_eq!(vars[0].get_info().unwrap().dims, vec![1, 3]);
    assert_eq!(vars[1].get_info().unwrap().dims, vec![1, 3]);
}

#[test]
fn file_round_trip_and_bad_header() {
    let path = std::env::temp_dir().join(format!("lazygraph-io-{}.bin", std::process::id()));
    let k = creator::constant(&[7i32, 8, 9], &[3]).unwrap();
    k.set_name("k");
    io::save_to_file(&[k], &path).unwrap();
    let map = io::load_map_from_file(&path).unwrap();
    assert_eq!(map["k"].read_map::<i32>().unwrap(), vec![7, 8, 9]);
    assert_eq!(io::map_to_sequence(&map).len(), 1);
    std::fs::remove_file(&path).unwrap();

    assert!(matches!(
        io::load_from_bytes(b"GRAPH???"),
        Err(Error::InvalidGraph(_))
    ));
}
