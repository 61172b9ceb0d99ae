use addnet::{AddLayer, LayerError, Parameters};
use approx::assert_abs_diff_eq;
use ndarray::{Array2, Array4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_map(rng: &mut StdRng, shape: (usize, usize, usize, usize)) -> Array4<f32> {
    Array4::from_shape_fn(shape, |_| rng.gen_range(-1.0..1.0))
}

fn random_id(rng: &mut StdRng, batch: usize, c_id: usize) -> Array2<f32> {
    Array2::from_shape_fn((batch, c_id), |_| rng.gen_range(-1.0..1.0))
}

fn fill(layer: &mut impl Parameters, name: &str, value: f32) {
    let mut found = false;
    for (n, mut t) in layer.named_parameters_mut() {
        if n == name {
            t.fill(value);
            found = true;
        }
    }
    assert!(found, "no parameter named {name}");
}

#[test]
fn test_shape_preserved() {
    let mut rng = StdRng::seed_from_u64(0);
    let layer = AddLayer::with_rng(6, 3, 5, &mut rng).unwrap();
    for &(b, h, w) in &[(1, 1, 1), (2, 4, 3), (3, 5, 5)] {
        let x = random_map(&mut rng, (b, 6, h, w));
        let z_att = random_map(&mut rng, (b, 3, h, w));
        let z_id = random_id(&mut rng, b, 5);
        let y = layer.forward(&x, &z_att, &z_id).unwrap();
        assert_eq!(y.shape(), x.shape());
    }
}

#[test]
fn test_parameter_names_follow_layout() {
    let layer = AddLayer::new(4, 4, 8).unwrap();
    let names: Vec<String> = layer.named_parameters().into_iter().map(|(n, _)| n).collect();
    assert_eq!(
        names,
        vec![
            "h_conv.weight",
            "h_conv.bias",
            "att_conv1.weight",
            "att_conv1.bias",
            "att_conv2.weight",
            "att_conv2.bias",
            "id_fc1.weight",
            "id_fc1.bias",
            "id_fc2.weight",
            "id_fc2.bias",
        ]
    );
    // 5 + 20 + 20 + 36 + 36
    assert_eq!(layer.num_parameters(), 117);
}

#[test]
fn test_mask_strictly_inside_unit_interval() {
    let mut rng = StdRng::seed_from_u64(4);
    let layer = AddLayer::with_rng(5, 2, 3, &mut rng).unwrap();
    let x = random_map(&mut rng, (2, 5, 4, 4));
    let z_att = random_map(&mut rng, (2, 2, 4, 4));
    let z_id = random_id(&mut rng, 2, 3);
    let trace = layer.forward_trace(&x, &z_att, &z_id).unwrap();
    assert_eq!(trace.mask.shape(), &[2, 1, 4, 4]);
    assert!(trace.mask.iter().all(|&m| m > 0.0 && m < 1.0));
}

#[test]
fn test_output_interpolates_between_branches() {
    let mut rng = StdRng::seed_from_u64(9);
    let mut layer = AddLayer::with_rng(3, 2, 4, &mut rng).unwrap();
    let x = random_map(&mut rng, (1, 3, 3, 3));
    let z_att = random_map(&mut rng, (1, 2, 3, 3));
    let z_id = random_id(&mut rng, 1, 4);
    fill(&mut layer, "h_conv.weight", 0.0);

    fill(&mut layer, "h_conv.bias", -30.0);
    let low = layer.forward_trace(&x, &z_att, &z_id).unwrap();
    for (out, a) in low.output.iter().zip(low.attribute.iter()) {
        assert_abs_diff_eq!(*out, *a, epsilon = 1e-5);
    }

    fill(&mut layer, "h_conv.bias", 30.0);
    let high = layer.forward_trace(&x, &z_att, &z_id).unwrap();
    for (out, i) in high.output.iter().zip(high.identity.iter()) {
        assert_abs_diff_eq!(*out, *i, epsilon = 1e-5);
    }
}

#[test]
fn test_golden_all_ones_input() {
    let mut layer = AddLayer::new(4, 4, 8).unwrap();
    for name in ["h_conv.bias", "att_conv1.bias", "att_conv2.bias", "id_fc1.bias", "id_fc2.bias"] {
        fill(&mut layer, name, 0.0);
    }
    fill(&mut layer, "id_fc1.weight", 0.0);
    fill(&mut layer, "id_fc2.weight", 0.0);
    fill(&mut layer, "att_conv1.weight", 0.25);
    fill(&mut layer, "att_conv2.weight", 0.5);

    let h = Array4::<f32>::ones((1, 4, 2, 2));
    let z_att = Array4::<f32>::ones((1, 4, 2, 2));
    let z_id = Array2::<f32>::zeros((1, 8));

    // h_norm = 0, so A = att_beta = 1, I = id_beta = 0 and M = sigmoid(bias)
    let trace = layer.forward_trace(&h, &z_att, &z_id).unwrap();
    assert_eq!(trace.output.shape(), &[1, 4, 2, 2]);
    assert!(trace.h_norm.iter().all(|&v| v == 0.0));
    assert!(trace.attribute.iter().all(|&v| v == 1.0));
    assert!(trace.identity.iter().all(|&v| v == 0.0));
    assert!(trace.output.iter().all(|&v| v == 0.5));

    fill(&mut layer, "h_conv.bias", 3.0_f32.ln());
    let y = layer.forward(&h, &z_att, &z_id).unwrap();
    for v in y.iter() {
        assert_abs_diff_eq!(*v, 0.25, epsilon = 1e-6);
    }
}

#[test]
fn test_feature_channel_mismatch_is_an_error() {
    let layer = AddLayer::new(4, 4, 8).unwrap();
    let h = Array4::<f32>::ones((1, 8, 2, 2));
    let z_att = Array4::<f32>::ones((1, 4, 2, 2));
    let z_id = Array2::<f32>::zeros((1, 8));
    let err = layer.forward(&h, &z_att, &z_id).unwrap_err();
    assert!(matches!(err, LayerError::ShapeMismatch { expected: 4, actual: 8, .. }));
}

#[test]
fn test_conditioning_mismatches_are_errors() {
    let layer = AddLayer::new(4, 4, 8).unwrap();
    let h = Array4::<f32>::ones((2, 4, 2, 2));

    let short_id = Array2::<f32>::zeros((2, 7));
    assert!(layer.forward(&h, &Array4::ones((2, 4, 2, 2)), &short_id).is_err());

    let wrong_att = Array4::<f32>::ones((2, 3, 2, 2));
    assert!(layer.forward(&h, &wrong_att, &Array2::zeros((2, 8))).is_err());

    let one_id = Array2::<f32>::zeros((1, 8));
    let err = layer.forward(&h, &Array4::ones((2, 4, 2, 2)), &one_id).unwrap_err();
    assert!(matches!(err, LayerError::ShapeMismatch { expected: 2, actual: 1, .. }));

    let big_att = Array4::<f32>::ones((2, 4, 3, 3));
    let err = layer.forward(&h, &big_att, &Array2::zeros((2, 8))).unwrap_err();
    assert!(matches!(err, LayerError::Broadcast { .. }));
}

#[test]
fn test_pointwise_attribute_broadcasts() {
    let mut rng = StdRng::seed_from_u64(21);
    let layer = AddLayer::with_rng(4, 2, 3, &mut rng).unwrap();
    let h = random_map(&mut rng, (2, 4, 3, 3));
    let z_att = random_map(&mut rng, (2, 2, 1, 1));
    let z_id = random_id(&mut rng, 2, 3);
    let y = layer.forward(&h, &z_att, &z_id).unwrap();
    assert_eq!(y.shape(), &[2, 4, 3, 3]);
}

#[test]
fn test_forward_is_deterministic() {
    let mut rng = StdRng::seed_from_u64(2);
    let layer = AddLayer::with_rng(4, 4, 8, &mut rng).unwrap();
    let h = random_map(&mut rng, (2, 4, 3, 3));
    let z_att = random_map(&mut rng, (2, 4, 3, 3));
    let z_id = random_id(&mut rng, 2, 8);
    let a = layer.forward(&h, &z_att, &z_id).unwrap();
    let b = layer.forward(&h, &z_att, &z_id).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_zero_channels_rejected() {
    for (c_x, c_att, c_id) in [(0, 4, 8), (4, 0, 8), (4, 4, 0)] {
        let err = AddLayer::new(c_x, c_att, c_id).unwrap_err();
        assert!(matches!(err, LayerError::InvalidConfig(_)));
    }
}
