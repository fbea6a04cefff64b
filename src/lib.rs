//! Pure Rust implementation of linear-chain and triangular-chain
//! Conditional Random Fields
//!
//! Four models share one capability interface, [`SequenceModel`]:
//!
//! * [`MaxEnt`]: a maximum-entropy classifier of independent events,
//! * [`Crf`]: a linear-chain CRF,
//! * [`TriCrf1`]: a triangular-chain CRF with a topic classifier and one
//!   sequence model per topic,
//! * [`TriCrf2`]: a triangular-chain CRF with a shared sequence model and
//!   topic/label compatibility weights.
//!
//! Weights are estimated by maximum likelihood with L-BFGS (Gaussian prior)
//! or OWL-QN (L1 prior), optionally initialised by pseudo-likelihood
//! training.
//!
//! # Examples
//!
//! ## Training
//!
//! ```no_run
//! use tricrf::{Attribute, SequenceModel, Trainer};
//!
//! let mut trainer = Trainer::crf().with_l2_prior(10.0)?;
//!
//! let xseq = vec![
//!     vec![Attribute::new("walk", 1.0)],
//!     vec![Attribute::new("shop", 1.0)],
//! ];
//! let yseq = vec!["sunny", "rainy"];
//! trainer.append(&xseq, &yseq)?;
//!
//! let (model, _report) = trainer.fit()?;
//! model.save("model.crf")?;
//! # Ok::<(), tricrf::Error>(())
//! ```
//!
//! ## Prediction
//!
//! ```no_run
//! use tricrf::{Attribute, Crf, SequenceModel, Tagger};
//!
//! let model = Crf::open("model.crf")?;
//! let mut tagger = Tagger::new(&model);
//!
//! let xseq = vec![
//!     vec![Attribute::new("walk", 1.0)],
//!     vec![Attribute::new("shop", 1.0)],
//! ];
//! let labels = tagger.tag_sequence(&xseq)?;
//! # Ok::<(), tricrf::Error>(())
//! ```

mod attribute;
mod context;
mod dataset;
mod dictionary;
mod error;
mod evaluate;
mod tagger;

/// Run configuration files
pub mod config;
/// Inference engines
pub mod model;
/// Quasi-Newton optimisers
pub mod optimize;
/// Parameter stores and transition indices
pub mod param;
/// Data file reader
pub mod reader;
/// Training module
pub mod train;

// Re-export main types
pub use self::attribute::Attribute;
pub use self::config::{Config, Mode, RunConfig};
pub use self::context::{ChainContext, Flag};
pub use self::dataset::{Document, Item, Observation, Sequence, Token, TopicEvent};
pub use self::dictionary::Dictionary;
pub use self::error::{clamp_log, Error, Result, LOG_ZERO};
pub use self::evaluate::{chunks, Chunk, ClassCounts, Evaluator, Scores};
pub use self::model::{
    Crf, Decoded, MaxEnt, ModelType, SequenceModel, TriCrf1, TriCrf2,
};
pub use self::reader::DataReader;
pub use self::tagger::{Prediction, Tagger};

// Re-export training types for convenience
pub use self::train::{Estimation, TrainParams, TrainReport, Trainer};
