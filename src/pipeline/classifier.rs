//! # Gesture Classifier
//!
//! The classifier is an opaque scoring function: it takes one [`Window`] and returns one
//! confidence per class. Everything that decides *whether* a score counts as a gesture lives
//! in [`crate::pipeline::policy`], not here.
//!
//! ## Key Components:
//! - **[`Classifier`]**: the scoring seam; the server uses [`LinearWindowClassifier`], tests use stubs
//! - **[`LinearWindowClassifier`]**: dense head over the flattened window, loaded with Candle
//! - **[`LabelTable`]**: fixed class-index → gesture-label mapping
//! - **[`ClassifierSlot`]**: load-once-then-cache accessor shared by the aggregator and request handlers
//!
//! ## Artifact format:
//! A safetensors file with `classifier.weight` shaped `[classes, 1260]` and
//! `classifier.bias` shaped `[classes]`. Output is softmaxed, so scores lie in [0, 1].

use crate::config::LabelOrder;
use crate::pipeline::frame::{Window, FRAME_LEN, WINDOW_FRAMES, WINDOW_LEN};
use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Linear, Module};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;
use tracing::{error, info, warn};

/// Scores one window. Implementations must be callable from several threads.
pub trait Classifier: Send + Sync {
    /// One confidence per class index. Values are comparable but need not sum to 1.
    fn predict(&self, window: &Window) -> Result<Vec<f32>>;

    /// Number of classes the model emits, when known up front.
    fn class_count(&self) -> Option<usize> {
        None
    }

    fn name(&self) -> &str;
}

/// Dense classification head over a flattened `[10, 126]` window.
pub struct LinearWindowClassifier {
    head: Linear,
    num_classes: usize,
    device: Device,
    name: String,
}

impl LinearWindowClassifier {
    /// Load the head from a safetensors artifact and warm it up once.
    pub fn load(path: &Path, device: Device) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow!("Classifier artifact not found at {}", path.display()));
        }

        let start_time = Instant::now();
        info!(path = %path.display(), "Loading gesture classifier");

        let mut tensors = candle_core::safetensors::load(path, &device)
            .with_context(|| format!("Failed to read safetensors from {}", path.display()))?;
        let weight = tensors
            .remove("classifier.weight")
            .ok_or_else(|| anyhow!("Artifact is missing 'classifier.weight'"))?;
        let bias = tensors
            .remove("classifier.bias")
            .ok_or_else(|| anyhow!("Artifact is missing 'classifier.bias'"))?;

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "classifier".to_string());
        let classifier = Self::from_tensors(weight, bias, device, name)?;

        // Warm-up pass doubles as a check that the output shape is usable
        let warmup = Window::from_flat(&vec![0.0; WINDOW_LEN])?;
        let scores = classifier.predict(&warmup)?;
        info!(
            classes = scores.len(),
            elapsed_ms = u64::try_from(start_time.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Gesture classifier loaded and verified"
        );

        Ok(classifier)
    }

    /// Build a head from in-memory tensors (`weight: [C, 1260]`, `bias: [C]`).
    pub fn from_tensors(weight: Tensor, bias: Tensor, device: Device, name: String) -> Result<Self> {
        let (num_classes, in_features) = weight.dims2()?;
        if in_features != WINDOW_LEN {
            return Err(anyhow!(
                "Classifier expects {} input features, artifact has {}",
                WINDOW_LEN,
                in_features
            ));
        }
        let bias_len = bias.dims1()?;
        if bias_len != num_classes {
            return Err(anyhow!(
                "Classifier bias has {} entries for {} classes",
                bias_len,
                num_classes
            ));
        }

        // Inference runs in f32 regardless of how the artifact was saved
        let weight = weight.to_dtype(DType::F32)?;
        let bias = bias.to_dtype(DType::F32)?;

        Ok(Self {
            head: Linear::new(weight, Some(bias)),
            num_classes,
            device,
            name,
        })
    }
}

impl Classifier for LinearWindowClassifier {
    fn predict(&self, window: &Window) -> Result<Vec<f32>> {
        let input = Tensor::from_vec(window.flatten(), (1, WINDOW_FRAMES * FRAME_LEN), &self.device)?;
        let logits = self.head.forward(&input)?;
        let probs = candle_nn::ops::softmax_last_dim(&logits)?;
        Ok(probs.squeeze(0)?.to_vec1::<f32>()?)
    }

    fn class_count(&self) -> Option<usize> {
        Some(self.num_classes)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Class index → gesture label, fixed for the life of the process.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelTable {
    labels: Vec<String>,
}

impl LabelTable {
    pub fn new(vocabulary: &[String], order: LabelOrder) -> Self {
        let mut labels = vocabulary.to_vec();
        if order == LabelOrder::Alphabetical {
            labels.sort();
        }
        Self { labels }
    }

    pub fn label(&self, class_id: usize) -> Option<&str> {
        self.labels.get(class_id).map(String::as_str)
    }

    /// Label for display; indices outside the table get a placeholder name.
    pub fn label_or_unknown(&self, class_id: usize) -> String {
        self.label(class_id)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Unknown_ID_{}", class_id))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.labels.iter().enumerate().map(|(i, l)| (i, l.as_str()))
    }
}

/// Produces a ready classifier. Called at most once per successful load.
pub type ClassifierLoader = Box<dyn Fn() -> Result<Arc<dyn Classifier>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum ClassifierStatus {
    Loaded { name: String },
    NotLoaded,
    Failed { message: String },
}

impl ClassifierStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassifierStatus::Loaded { .. } => "loaded",
            ClassifierStatus::NotLoaded => "not_loaded",
            ClassifierStatus::Failed { .. } => "failed",
        }
    }
}

/// Lazily loaded, cached classifier.
///
/// ## Thread Safety:
/// Readers take the `RwLock` only long enough to clone the `Arc`. Loading is serialized by a
/// separate mutex and re-checks the cache after acquiring it, so two concurrent callers never
/// load the artifact twice.
pub struct ClassifierSlot {
    loaded: RwLock<Option<Arc<dyn Classifier>>>,
    load_gate: Mutex<()>,
    loader: ClassifierLoader,
    last_error: RwLock<Option<String>>,
    expected_classes: usize,
    load_count: AtomicUsize,
}

impl ClassifierSlot {
    /// `expected_classes` is the vocabulary size; a model emitting a different
    /// count is logged but still used.
    pub fn new(loader: ClassifierLoader, expected_classes: usize) -> Self {
        Self {
            loaded: RwLock::new(None),
            load_gate: Mutex::new(()),
            loader,
            last_error: RwLock::new(None),
            expected_classes,
            load_count: AtomicUsize::new(0),
        }
    }

    /// The cached classifier, without attempting a load.
    pub fn get(&self) -> Option<Arc<dyn Classifier>> {
        self.loaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The cached classifier, loading it first if needed.
    pub fn get_or_load(&self) -> Result<Arc<dyn Classifier>> {
        if let Some(classifier) = self.get() {
            return Ok(classifier);
        }

        let _gate = self.load_gate.lock().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have finished loading while we waited
        if let Some(classifier) = self.get() {
            return Ok(classifier);
        }

        self.load_count.fetch_add(1, Ordering::SeqCst);
        match (self.loader)() {
            Ok(classifier) => {
                self.check_class_count(classifier.as_ref());
                *self.loaded.write().unwrap_or_else(PoisonError::into_inner) =
                    Some(classifier.clone());
                *self.last_error.write().unwrap_or_else(PoisonError::into_inner) = None;
                Ok(classifier)
            }
            Err(err) => {
                error!(error = %format!("{:#}", err), "Failed to load gesture classifier");
                *self.last_error.write().unwrap_or_else(PoisonError::into_inner) =
                    Some(format!("{:#}", err));
                Err(err)
            }
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.get().is_some()
    }

    pub fn status(&self) -> ClassifierStatus {
        if let Some(classifier) = self.get() {
            return ClassifierStatus::Loaded {
                name: classifier.name().to_string(),
            };
        }
        match self.last_error.read().unwrap_or_else(PoisonError::into_inner).clone() {
            Some(message) => ClassifierStatus::Failed { message },
            None => ClassifierStatus::NotLoaded,
        }
    }

    /// How many times the loader has been invoked.
    pub fn load_attempts(&self) -> usize {
        self.load_count.load(Ordering::SeqCst)
    }

    fn check_class_count(&self, classifier: &dyn Classifier) {
        match classifier.class_count() {
            Some(count) if count != self.expected_classes => warn!(
                model_classes = count,
                labels = self.expected_classes,
                "Classifier output size does not match the gesture vocabulary"
            ),
            Some(count) => info!(classes = count, "Classifier output matches the gesture vocabulary"),
            None => {}
        }
    }
}
