use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tricrf::{Attribute, Crf, Document, SequenceModel, Token, TopicEvent, TriCrf1, TriCrf2};

fn token(label: &str, words: &[&str]) -> Token {
    Token::new(label, words.iter().map(|w| Attribute::from(*w)).collect())
}

fn training_docs() -> Vec<Document> {
    vec![
        Document {
            topic: Some(TopicEvent::new("flight", vec![Attribute::from("fly")])),
            tokens: vec![token("O", &["fly"]), token("B-city", &["boston"])],
        },
        Document {
            topic: Some(TopicEvent::new("fare", vec![Attribute::from("cost")])),
            tokens: vec![
                token("O", &["cost"]),
                token("B-class", &["first"]),
                token("B-city", &["denver"]),
            ],
        },
        Document {
            topic: Some(TopicEvent::new("flight", vec![Attribute::from("to")])),
            tokens: vec![token("B-city", &["boston"]), token("O", &["to"])],
        },
    ]
}

fn test_tokens() -> Vec<Token> {
    vec![
        token("O", &["fly", "cost"]),
        token("O", &["boston", "first"]),
        token("O", &["unseen"]),
        token("O", &["to", "denver"]),
    ]
}

fn randomized<M: SequenceModel>(seed: u64) -> M {
    let (mut model, _) = M::build(&training_docs()).unwrap();
    model.finalize(None).unwrap();
    let mut rng = StdRng::seed_from_u64(seed);
    for w in model.weights_mut().iter_mut() {
        *w = rng.gen_range(-1.5..1.5);
    }
    model
}

/// Every label sequence of length `len` over `k` labels
fn label_paths(k: u32, len: usize) -> Vec<Vec<u32>> {
    let mut paths = vec![Vec::new()];
    for _ in 0..len {
        paths = paths
            .into_iter()
            .flat_map(|p| {
                (0..k).map(move |y| {
                    let mut next = p.clone();
                    next.push(y);
                    next
                })
            })
            .collect();
    }
    paths
}

fn with_labels<M: SequenceModel>(model: &M, tokens: &[Token], path: &[u32]) -> Vec<Token> {
    tokens
        .iter()
        .zip(path)
        .map(|(t, &y)| Token::new(model.label_name(y).unwrap(), t.attrs.clone()))
        .collect()
}

/// Probability of every joint assignment and the decoded probability
fn enumerate<M: SequenceModel>(
    model: &M,
    num_labels: u32,
    topics: &[Option<TopicEvent>],
) -> (Vec<f64>, f64) {
    let tokens = test_tokens();
    let mut ws = model.workspace(tokens.len());
    let mut probs = Vec::new();
    for topic in topics {
        for path in label_paths(num_labels, tokens.len()) {
            let doc = Document {
                topic: topic.clone(),
                tokens: with_labels(model, &tokens, &path),
            };
            let sample = model.encode(&doc).unwrap();
            model.calculate_factors(model.weights(), &sample, &mut ws).unwrap();
            model.forward(&mut ws).unwrap();
            probs.push(model.calculate_prob(&sample, &ws));
        }
    }
    let doc = Document {
        topic: topics[0].clone(),
        tokens,
    };
    let sample = model.encode(&doc).unwrap();
    model.calculate_factors(model.weights(), &sample, &mut ws).unwrap();
    model.forward(&mut ws).unwrap();
    let decoded = model.viterbi_search(&mut ws).unwrap();
    (probs, decoded.probability)
}

fn check(probs: &[f64], decoded: f64) {
    let total: f64 = probs.iter().sum();
    assert!((total - 1.0).abs() < 1e-9, "total probability {}", total);
    let best = probs.iter().copied().fold(0.0, f64::max);
    assert!((decoded - best).abs() < 1e-9, "decoded {} best {}", decoded, best);
    for p in probs {
        assert!(*p >= 0.0 && *p <= 1.0 + 1e-12);
    }
}

fn topic_events<M: SequenceModel>(model: &M, num_topics: usize) -> Vec<Option<TopicEvent>> {
    (0..num_topics as u32)
        .map(|z| {
            Some(TopicEvent::new(
                model.topic_name(z).unwrap(),
                vec![Attribute::from("fly"), Attribute::new("cost", 0.5)],
            ))
        })
        .collect()
}

#[test]
fn test_crf_normalization() {
    for seed in 0..3 {
        let model: Crf = randomized(seed);
        let k = model.num_labels() as u32;
        let (probs, decoded) = enumerate(&model, k, &[None]);
        assert_eq!(probs.len(), k.pow(4) as usize);
        check(&probs, decoded);
    }
}

#[test]
fn test_tricrf1_joint_normalization() {
    for seed in 0..3 {
        let model: TriCrf1 = randomized(seed);
        let topics = topic_events(&model, model.num_topics());
        let k = model.num_labels() as u32;
        let (probs, decoded) = enumerate(&model, k, &topics);
        assert_eq!(probs.len(), 2 * k.pow(4) as usize);
        check(&probs, decoded);
    }
}

#[test]
fn test_tricrf2_joint_normalization() {
    for seed in 0..3 {
        let model: TriCrf2 = randomized(seed);
        let topics = topic_events(&model, model.num_topics());
        let (probs, decoded) = enumerate(&model, model.num_labels() as u32, &topics);
        check(&probs, decoded);
        // B-class never occurs under "flight", the first topic
        let class = (0..model.num_labels() as u32)
            .find(|&y| model.label_name(y) == Some("B-class"))
            .unwrap();
        for (i, path) in label_paths(model.num_labels() as u32, 4).iter().enumerate() {
            if path.contains(&class) {
                assert!(probs[i] < 1e-300, "path {:?} under flight", path);
            }
        }
    }
}

#[test]
fn test_listed_transitions_far_below_default() {
    for seed in 0..3 {
        let mut model: Crf = randomized(seed);
        let slots: Vec<usize> = model
            .store()
            .edge_index()
            .unwrap()
            .edges()
            .iter()
            .map(|e| e.slot as usize)
            .collect();
        assert!(!slots.is_empty());
        let mut rng = StdRng::seed_from_u64(100 + seed);
        for w in model.weights_mut().iter_mut() {
            *w = rng.gen_range(-30.0..30.0);
        }
        // unlisted transitions keep the default weight of zero
        for slot in slots {
            model.weights_mut()[slot] = rng.gen_range(-60.0..-30.0);
        }
        let k = model.num_labels() as u32;
        let (probs, decoded) = enumerate(&model, k, &[None]);
        check(&probs, decoded);
    }
}
