use std::fs;

use tricrf::{
    Attribute, Crf, DataReader, Document, Evaluator, MaxEnt, ModelType, RunConfig, SequenceModel,
    Tagger, Trainer, TriCrf1, TriCrf2,
};

fn weather() -> (Vec<Vec<Attribute>>, Vec<&'static str>) {
    let xseq = vec![
        vec![Attribute::new("walk", 1.0), Attribute::new("shop", 0.5)],
        vec![Attribute::new("walk", 1.0)],
        vec![Attribute::new("walk", 1.0), Attribute::new("clean", 0.5)],
        vec![Attribute::new("shop", 0.5), Attribute::new("clean", 0.5)],
        vec![Attribute::new("walk", 0.5), Attribute::new("clean", 1.0)],
        vec![Attribute::new("clean", 1.0), Attribute::new("shop", 0.1)],
        vec![Attribute::new("walk", 1.0), Attribute::new("shop", 0.5)],
        vec![],
        vec![Attribute::new("clean", 1.0)],
    ];
    let yseq = vec![
        "sunny", "sunny", "sunny", "rainy", "rainy", "rainy", "sunny", "sunny", "rainy",
    ];
    (xseq, yseq)
}

#[test]
fn test_train_save_load_predict() {
    let (xseq, yseq) = weather();
    let mut trainer = Trainer::crf().with_l2_prior(10.0).unwrap();
    trainer.append(&xseq, &yseq).unwrap();
    let (model, report) = trainer.fit().unwrap();
    assert!(report.iterations > 0);

    // Use NamedTempFile for automatic cleanup on panic
    let temp_file = tempfile::NamedTempFile::new().unwrap();
    model.save(temp_file.path()).unwrap();
    let loaded = Crf::open(temp_file.path()).unwrap();

    assert_eq!(loaded.num_labels(), 2);
    assert_eq!(loaded.label_name(0), Some("sunny"));
    assert_eq!(loaded.label_name(1), Some("rainy"));
    assert_eq!(loaded.weights(), model.weights());

    let mut before = Tagger::new(&model);
    let mut after = Tagger::new(&loaded);
    let doc = Document::from_sequence(&xseq, &yseq);
    let expected = before.tag(&doc).unwrap();
    let actual = after.tag(&doc).unwrap();
    assert_eq!(expected.labels, actual.labels);
    assert!((expected.probability - actual.probability).abs() < 1e-12);

    let correct = actual
        .labels
        .iter()
        .zip(&yseq)
        .filter(|(p, y)| p.as_str() == **y)
        .count();
    let accuracy = correct as f64 / yseq.len() as f64;
    assert!(accuracy > 0.5, "Training accuracy too low: {}", accuracy);
}

#[test]
fn test_separable_data_is_recovered() {
    let xseq = vec![
        vec![Attribute::new("a", 1.0)],
        vec![Attribute::new("b", 1.0)],
        vec![Attribute::new("c", 1.0)],
        vec![Attribute::new("a", 1.0)],
        vec![Attribute::new("b", 1.0)],
    ];
    let yseq = vec!["X", "Y", "X", "X", "Y"];

    let mut trainer = Trainer::crf().with_max_iterations(200).unwrap();
    trainer.append(&xseq, &yseq).unwrap();
    let (model, report) = trainer.fit().unwrap();
    // The separable objective keeps decreasing towards zero
    assert!(report.objective < 0.5, "objective {}", report.objective);

    let mut tagger = Tagger::new(&model);
    let labels = tagger.tag_sequence(&xseq).unwrap();
    assert_eq!(labels, yseq);
}

fn atis_docs() -> Vec<Document> {
    let data = "\
flight w=show w=flights w=boston
O w=show
O w=flights
B-city w=boston

fare w=cost w=first w=denver
O w=cost
B-class w=first
B-city w=denver

flight w=flights w=denver
O w=flights
B-city w=denver

fare w=fare w=boston
O w=fare
B-city w=boston
";
    DataReader::triangular().read(data.as_bytes()).unwrap()
}

fn check_triangular<M: SequenceModel>(mut trainer: Trainer<M>) {
    let docs = atis_docs();
    for doc in &docs {
        trainer.append_document(doc.clone()).unwrap();
    }
    let (model, _) = trainer.fit().unwrap();

    let temp_file = tempfile::NamedTempFile::new().unwrap();
    model.save(temp_file.path()).unwrap();
    let loaded = M::open(temp_file.path()).unwrap();
    assert_eq!(loaded.weights(), model.weights());

    let mut tagger = Tagger::new(&loaded);
    let mut evaluator = Evaluator::new(true);
    for doc in &docs {
        let (prediction, log_prob) = tagger.tag_with_likelihood(doc).unwrap();
        evaluator.append(&doc.labels(), &prediction.labels).unwrap();
        let gold = doc.topic.as_ref().unwrap();
        evaluator.append_topic(&gold.label, prediction.topic.as_deref().unwrap());
        evaluator.add_log_likelihood(log_prob);
        assert_eq!(prediction.confidence.len(), doc.len());
    }
    assert_eq!(evaluator.accuracy(), 1.0);
    assert_eq!(evaluator.topic_accuracy(), Some(1.0));
    assert_eq!(evaluator.micro().f1, 1.0);
    assert!(evaluator.log_likelihood() < 0.0);
}

#[test]
fn test_tricrf1_end_to_end() {
    check_triangular(Trainer::<TriCrf1>::new());
}

#[test]
fn test_tricrf2_end_to_end() {
    check_triangular(Trainer::<TriCrf2>::new());
}

#[test]
fn test_tricrf2_with_pretraining() {
    check_triangular(Trainer::tricrf2().with_pretraining(10).unwrap());
}

#[test]
fn test_configured_run() {
    let dir = tempfile::tempdir().unwrap();
    let train = dir.path().join("train.txt");
    fs::write(&train, "B-city w=boston\nO w=to\n\nO w=from\nB-city w=denver\n").unwrap();
    let config = dir.path().join("run.cfg");
    fs::write(
        &config,
        format!(
            "# chain model\nmodel_type = CRF\nmode = train\ntrain_file = {}\nmodel_file = {}\niter = 50\n",
            train.display(),
            dir.path().join("model").display()
        ),
    )
    .unwrap();

    let run = RunConfig::from_file(&config).unwrap();
    let docs = DataReader::chain().read_file(&run.train_files[0]).unwrap();
    let mut trainer = Trainer::<Crf>::new();
    *trainer.params_mut() = run.params.clone();
    for doc in docs {
        trainer.append_document(doc).unwrap();
    }
    let (model, _) = trainer.fit().unwrap();
    model.save(&run.model_files[0]).unwrap();
    assert!(run.model_files[0].exists());

    let loaded = Crf::open(&run.model_files[0]).unwrap();
    let mut tagger = Tagger::new(&loaded);
    let labels = tagger
        .tag_sequence(&[vec![Attribute::from("w=boston")], vec![Attribute::from("w=to")]])
        .unwrap();
    assert_eq!(labels, vec!["B-city", "O"]);
}

#[test]
fn test_maxent_end_to_end() {
    let data = "\
flight w=show w=flights
fare w=cost w=first

flight w=flights w=to
fare w=fare w=cost
";
    let docs = DataReader::chain().read(data.as_bytes()).unwrap();
    let mut trainer = Trainer::maxent().with_l2_prior(10.0).unwrap();
    for doc in &docs {
        trainer.append_document(doc.clone()).unwrap();
    }
    let (model, _) = trainer.fit().unwrap();

    let temp_file = tempfile::NamedTempFile::new().unwrap();
    model.save(temp_file.path()).unwrap();
    let loaded = MaxEnt::open(temp_file.path()).unwrap();
    assert_eq!(loaded.weights(), model.weights());
    assert_eq!(loaded.num_labels(), 2);

    let mut tagger = Tagger::new(&loaded);
    let mut evaluator = Evaluator::new(false);
    for doc in &docs {
        let prediction = tagger.tag(doc).unwrap();
        assert!(prediction.topic.is_none());
        let joint: f64 = prediction.confidence.iter().product();
        assert!((joint - prediction.probability).abs() < 1e-9);
        evaluator.append(&doc.labels(), &prediction.labels).unwrap();
    }
    assert_eq!(evaluator.accuracy(), 1.0);
    assert_eq!("MaxEnt".parse::<ModelType>().unwrap(), MaxEnt::MODEL_TYPE);
}
