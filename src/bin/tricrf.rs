//! Train and apply sequence models as described by a configuration file.
//!
//! ```text
//! tricrf <config>
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use std::env;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tricrf::{
    Crf, DataReader, Document, Evaluator, MaxEnt, ModelType, RunConfig, SequenceModel, Tagger,
    Trainer, TriCrf1, TriCrf2,
};

fn init_logging(log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("cannot create log file {}", path.display()))?;
            builder.with_writer(Mutex::new(file)).with_ansi(false).init();
        }
        None => builder.init(),
    }
    Ok(())
}

fn evaluate<M: SequenceModel>(
    model: &M,
    docs: &[Document],
    name: &str,
    mut output: Option<&mut dyn Write>,
    confidence: bool,
) -> anyhow::Result<()> {
    let mut tagger = Tagger::new(model);
    let mut evaluator = Evaluator::new(true);
    for doc in docs {
        let (prediction, log_prob) = tagger.tag_with_likelihood(doc)?;
        evaluator.append(&doc.labels(), &prediction.labels)?;
        if let (Some(gold), Some(topic)) = (&doc.topic, &prediction.topic) {
            evaluator.append_topic(&gold.label, topic);
        }
        evaluator.add_log_likelihood(log_prob);
        if let Some(out) = output.as_mut() {
            prediction.write_to(out, confidence)?;
        }
    }
    evaluator.report(name);
    Ok(())
}

fn read(reader: &DataReader, path: &Path) -> anyhow::Result<Vec<Document>> {
    reader
        .read_file(path)
        .with_context(|| format!("cannot read data file {}", path.display()))
}

fn train<M: SequenceModel>(run: &RunConfig, reader: &DataReader) -> anyhow::Result<()> {
    for (i, (train_file, model_file)) in run.train_files.iter().zip(&run.model_files).enumerate() {
        info!(file = %train_file.display(), "training");
        let docs = read(reader, train_file)?;
        let mut trainer = Trainer::<M>::new();
        *trainer.params_mut() = run.params.clone();
        trainer.verbose(true);
        for doc in docs {
            trainer.append_document(doc)?;
        }
        let (mut model, report) = trainer.fit()?;
        info!(
            status = %report.status,
            objective = report.objective,
            iterations = report.iterations,
            "training finished"
        );
        model.set_topic_prune(run.prune);
        if let Some(dev_file) = run.dev_files.get(i) {
            let docs = read(reader, dev_file)?;
            evaluate(&model, &docs, &dev_file.display().to_string(), None, false)?;
        }
        model
            .save(model_file)
            .with_context(|| format!("cannot save model {}", model_file.display()))?;
        info!(file = %model_file.display(), "model saved");
    }
    Ok(())
}

fn test<M: SequenceModel>(run: &RunConfig, reader: &DataReader) -> anyhow::Result<()> {
    for (i, (test_file, model_file)) in run.test_files.iter().zip(&run.model_files).enumerate() {
        info!(file = %test_file.display(), "testing");
        let mut model = M::open(model_file)
            .with_context(|| format!("cannot load model {}", model_file.display()))?;
        model.set_topic_prune(run.prune);
        let docs = read(reader, test_file)?;
        let name = test_file.display().to_string();
        match run.output_files.get(i) {
            Some(path) => {
                let file = File::create(path)
                    .with_context(|| format!("cannot create output file {}", path.display()))?;
                let mut out = BufWriter::new(file);
                evaluate(&model, &docs, &name, Some(&mut out as &mut dyn Write), run.confidence)?;
                out.flush()?;
            }
            None => evaluate(&model, &docs, &name, None, false)?,
        }
    }
    Ok(())
}

fn execute<M: SequenceModel>(run: &RunConfig) -> anyhow::Result<()> {
    let reader = match M::MODEL_TYPE {
        ModelType::MaxEnt | ModelType::Crf => DataReader::chain(),
        ModelType::TriCrf1 | ModelType::TriCrf2 => DataReader::triangular(),
    };
    if run.mode.trains() {
        train::<M>(run, &reader)?;
    }
    if run.mode.tests() {
        test::<M>(run, &reader)?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let path: PathBuf = env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("usage: tricrf <config>"))?;
    let run = RunConfig::from_file(&path)
        .with_context(|| format!("cannot load configuration {}", path.display()))?;
    init_logging(run.log_file.as_deref())?;
    info!(
        config = %path.display(),
        model_type = %run.model_type,
        mode = ?run.mode,
        "configuration"
    );

    match run.model_type {
        ModelType::MaxEnt => execute::<MaxEnt>(&run),
        ModelType::Crf => execute::<Crf>(&run),
        ModelType::TriCrf1 => execute::<TriCrf1>(&run),
        ModelType::TriCrf2 => execute::<TriCrf2>(&run),
    }
}
