use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use bavgpt::data::{DataConfig, META_FILE, NameProcessor, SPLIT_FILES, TokenDataset};
use bavgpt::inference::{SampleConfig, generate_name};
use bavgpt::model::{BavGpt, GptConfig, IGNORE_INDEX, ParamRole, TOKEN_EMBEDDING};
use bavgpt::tokenizer::CharVocab;
use bavgpt::train::{TrainConfig, Trainer};
use bavgpt::weights::{load_checkpoint, save_checkpoint};
use candle_core::{DType, Device, Tensor, Var};
use rand::SeedableRng;
use rand::rngs::StdRng;

fn tiny_config() -> GptConfig {
    GptConfig {
        context_len: 8,
        vocab_size: 5,
        n_embd: 16,
        n_head: 2,
        n_layer: 2,
        ..GptConfig::default()
    }
}

fn temp_dir(tag: &str) -> PathBuf {
    let uniq = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("timestamp")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("bavgpt_{tag}_{uniq}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn param_values(model: &BavGpt) -> Vec<(String, Vec<f32>)> {
    model
        .params()
        .entries()
        .iter()
        .map(|e| {
            let values = e
                .var
                .flatten_all()
                .expect("flatten")
                .to_vec1::<f32>()
                .expect("to_vec1");
            (e.name.clone(), values)
        })
        .collect()
}

#[test]
fn forward_with_partially_ignored_targets() {
    let device = Device::Cpu;
    let model = BavGpt::new(tiny_config(), &device, true, 0).expect("model");
    let idx = Tensor::new(
        &[[0u32, 1, 2, 3, 4, 0, 1, 2], [4u32, 3, 2, 1, 0, 4, 3, 2]],
        &device,
    )
    .expect("idx");
    let targets = Tensor::new(
        &[
            [1i64, 2, 3, 4, 0, 1, IGNORE_INDEX, IGNORE_INDEX],
            [3i64, 2, 1, 0, 4, 3, 2, IGNORE_INDEX],
        ],
        &device,
    )
    .expect("targets");

    let (logits, loss) = model.forward(&idx, Some(&targets)).expect("forward");
    assert_eq!(logits.dims(), &[2, 8, 5]);
    let loss: f32 = loss.expect("loss").to_scalar().expect("scalar");
    assert!(loss.is_finite() && loss >= 0.0, "loss={loss}");
}

#[test]
fn all_ignored_targets_give_zero_loss() {
    let device = Device::Cpu;
    let model = BavGpt::new(tiny_config(), &device, true, 3).expect("model");
    let idx = Tensor::zeros((2, 4), DType::U32, &device).expect("idx");
    let targets = Tensor::full(IGNORE_INDEX, (2, 4), &device).expect("targets");
    let (_, loss) = model.forward(&idx, Some(&targets)).expect("forward");
    let loss: f32 = loss.expect("loss").to_scalar().expect("scalar");
    assert_eq!(loss, 0.0);
}

#[test]
fn future_tokens_do_not_change_earlier_logits() {
    let device = Device::Cpu;
    let mut model = BavGpt::new(tiny_config(), &device, true, 1).expect("model");
    model.eval();

    let a = Tensor::new(&[[0u32, 1, 2, 3, 4, 0, 1, 2]], &device).expect("a");
    let b = Tensor::new(&[[0u32, 1, 2, 3, 4, 4, 4, 4]], &device).expect("b");
    let targets = Tensor::zeros((1, 8), DType::I64, &device).expect("targets");

    let (la, _) = model.forward(&a, Some(&targets)).expect("forward a");
    let (lb, _) = model.forward(&b, Some(&targets)).expect("forward b");
    let la: Vec<Vec<f32>> = la.squeeze(0).expect("squeeze").to_vec2().expect("vec");
    let lb: Vec<Vec<f32>> = lb.squeeze(0).expect("squeeze").to_vec2().expect("vec");

    for t in 0..5 {
        for (x, y) in la[t].iter().zip(&lb[t]) {
            assert!((x - y).abs() < 1e-5, "position {t} changed: {x} vs {y}");
        }
    }
    let later_differs = la[5].iter().zip(&lb[5]).any(|(x, y)| (x - y).abs() > 1e-6);
    assert!(later_differs);
}

#[test]
fn token_embedding_and_head_share_storage() {
    let device = Device::Cpu;
    let model = BavGpt::new(tiny_config(), &device, true, 0).expect("model");
    assert_eq!(model.token_embedding().id(), model.lm_head_weight().id());

    let replacement = Tensor::ones((5, 16), DType::F32, &device).expect("ones");
    model
        .params()
        .get(TOKEN_EMBEDDING)
        .expect("wte")
        .var
        .set(&replacement)
        .expect("set");
    let head: Vec<Vec<f32>> = model.lm_head_weight().to_vec2().expect("vec");
    assert!(head.iter().flatten().all(|v| *v == 1.0));

    // Writing through the head weight shows up in the token embedding.
    let head_var = Var::from_tensor(model.lm_head_weight()).expect("head var");
    let twos = Tensor::full(2f32, (5, 16), &device).expect("twos");
    head_var.set(&twos).expect("set head");
    let embedding: Vec<Vec<f32>> = model.token_embedding().to_vec2().expect("vec");
    assert!(embedding.iter().flatten().all(|v| *v == 2.0));
    assert_eq!(model.lm_head_weight().id(), model.token_embedding().id());
}

#[test]
fn optimizer_step_updates_tied_weight_once() {
    let text = "abcd\n".repeat(10);
    let vocab = CharVocab::from_names(&[text.as_str()]);
    let tokens = vocab.encode(&text).expect("encode");
    let model = BavGpt::new(tiny_config(), &Device::Cpu, true, 0).expect("model");
    let before: Vec<Vec<f32>> = model.token_embedding().to_vec2().expect("vec");

    let config = TrainConfig {
        batch_size: 4,
        learning_rate: 1e-2,
        ..TrainConfig::default()
    };
    let mut trainer = Trainer::new(
        config,
        model,
        vocab,
        TokenDataset::new(tokens.clone()),
        TokenDataset::new(tokens),
    )
    .expect("trainer");
    trainer.step().expect("step");

    let after: Vec<Vec<f32>> = trainer.model().token_embedding().to_vec2().expect("vec");
    let head: Vec<Vec<f32>> = trainer.model().lm_head_weight().to_vec2().expect("vec");
    assert_ne!(before, after);
    assert_eq!(after, head);
    let embedding_vars = trainer
        .model()
        .params()
        .entries()
        .iter()
        .filter(|e| e.role == ParamRole::EmbeddingWeight)
        .count();
    assert_eq!(embedding_vars, 2);
}

#[test]
fn parameter_count_matches_layout() {
    let model = BavGpt::new(tiny_config(), &Device::Cpu, false, 0).expect("model");
    // wte 5*16 + wpe 8*16 + 2 blocks * 3280 + ln_f 32
    assert_eq!(model.num_params(false), 6800);
    assert_eq!(model.num_params(false) - model.num_params(true), 8 * 16);
}

#[test]
fn same_seed_same_parameters() {
    let device = Device::Cpu;
    let a = BavGpt::new(tiny_config(), &device, true, 1234).expect("a");
    let b = BavGpt::new(tiny_config(), &device, true, 1234).expect("b");
    let c = BavGpt::new(tiny_config(), &device, true, 4321).expect("c");
    assert_eq!(param_values(&a), param_values(&b));
    assert_ne!(param_values(&a), param_values(&c));
}

#[test]
fn disabled_init_keeps_defaults() {
    let model = BavGpt::new(tiny_config(), &Device::Cpu, false, 0).expect("model");
    for entry in model.params().entries() {
        let expected = if entry.role == ParamRole::NormWeight {
            1.0
        } else {
            0.0
        };
        let values = entry
            .var
            .flatten_all()
            .expect("flatten")
            .to_vec1::<f32>()
            .expect("vec");
        assert!(
            values.iter().all(|v| *v == expected),
            "{} not at default",
            entry.name
        );
    }
}

#[test]
fn head_size_follows_heads() {
    let config = GptConfig::default();
    assert_eq!(config.head_size(), 32);
    let bad = GptConfig {
        n_embd: 255,
        ..GptConfig::default()
    };
    assert!(bad.validate().is_err());
    assert!(BavGpt::new(bad, &Device::Cpu, true, 0).is_err());
}

#[test]
fn checkpoint_roundtrip_reproduces_logits() {
    let device = Device::Cpu;
    let dir = temp_dir("ckpt");
    let vocab = CharVocab::from_names(&["abcd\n"]);
    assert_eq!(vocab.vocab_size(), 5);

    let mut model = BavGpt::new(tiny_config(), &device, true, 9).expect("model");
    model.eval();
    save_checkpoint(&model, &vocab, &dir).expect("save");

    let (loaded, loaded_vocab) = load_checkpoint(&dir, &device).expect("load");
    assert!(!loaded.is_training());
    assert_eq!(loaded_vocab, vocab);
    assert_eq!(loaded.token_embedding().id(), loaded.lm_head_weight().id());

    let idx = Tensor::new(&[[4u32, 0, 1, 2, 3]], &device).expect("idx");
    let (expected, _) = model.forward(&idx, None).expect("forward");
    let (actual, _) = loaded.forward(&idx, None).expect("forward loaded");
    let expected: Vec<f32> = expected.flatten_all().expect("flat").to_vec1().expect("vec");
    let actual: Vec<f32> = actual.flatten_all().expect("flat").to_vec1().expect("vec");
    assert_eq!(expected, actual);

    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn prepare_writes_splits_and_vocab() {
    let dir = temp_dir("prepare");
    let input = dir.join("names.txt");
    let names: String = (0..40)
        .map(|i| format!("{}ing\n", ["Erd", "Freis", "Plattl", "Ötl"][i % 4]))
        .chain(["X\n".to_string()])
        .collect();
    std::fs::write(&input, names).expect("write names");

    let config = DataConfig {
        input_file: input,
        output_dir: dir.join("out"),
        ..DataConfig::default()
    };
    let summary = NameProcessor::new(config).execute().expect("prepare");
    assert_eq!(summary.valid_names, 40);
    assert_eq!(
        summary.train_tokens + summary.dev_tokens + summary.test_tokens,
        summary.total_tokens
    );

    let out = dir.join("out");
    let train = TokenDataset::from_bin(&out.join(SPLIT_FILES[0])).expect("train.bin");
    assert_eq!(train.len(), summary.train_tokens);
    let vocab = CharVocab::load(&out.join(META_FILE)).expect("meta.json");
    assert_eq!(vocab.vocab_size(), summary.vocab_size);
    assert!(vocab.newline_id().is_some());
    assert!(vocab.char_id('Ö').is_some());
    assert!(vocab.char_id('X').is_none());

    let _ = std::fs::remove_dir_all(dir);
}

/// A model whose output is decided only by the head bias: with zeroed weights the final layer
/// norm emits zeros, so logits equal the bias.
fn bias_driven_model(vocab: &CharVocab, favored: char) -> BavGpt {
    let config = GptConfig {
        context_len: 4,
        vocab_size: vocab.vocab_size(),
        n_embd: 8,
        n_head: 2,
        n_layer: 1,
        lm_head_bias: true,
        ..GptConfig::default()
    };
    let device = Device::Cpu;
    let mut model = BavGpt::new(config, &device, false, 0).expect("model");
    let favored = vocab.char_id(favored).expect("favored char") as usize;
    let bias: Vec<f32> = (0..vocab.vocab_size())
        .map(|i| if i == favored { 10.0 } else { 0.0 })
        .collect();
    let bias = Tensor::from_vec(bias, vocab.vocab_size(), &device).expect("bias");
    model
        .params()
        .get("lm_head.bias")
        .expect("lm_head.bias")
        .var
        .set(&bias)
        .expect("set");
    model.eval();
    model
}

#[test]
fn generation_stops_at_newline() {
    let vocab = CharVocab::from_names(&["ab\n"]);
    let model = bias_driven_model(&vocab, '\n');
    let cfg = SampleConfig {
        temperature: 0.0,
        ..SampleConfig::default()
    };
    let mut rng = StdRng::seed_from_u64(0);
    let name = generate_name(&model, &vocab, &cfg, &mut rng).expect("generate");
    assert_eq!(name, "");
}

#[test]
fn generation_respects_max_length_past_context() {
    let vocab = CharVocab::from_names(&["ab\n"]);
    let model = bias_driven_model(&vocab, 'a');
    let cfg = SampleConfig {
        temperature: 0.0,
        max_length: 11,
        ..SampleConfig::default()
    };
    let mut rng = StdRng::seed_from_u64(0);
    let name = generate_name(&model, &vocab, &cfg, &mut rng).expect("generate");
    assert_eq!(name, "a".repeat(11));
}
