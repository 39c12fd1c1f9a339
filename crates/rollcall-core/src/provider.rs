//! Embedding provider seam: frame in, detected faces with embeddings out.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Embedding};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// SCRFD detection model file name inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// ArcFace recognition model file name inside the model directory.
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error(
        "missing model files in {dir}: {missing:?}\n\
         Download the insightface buffalo_l pack (https://github.com/deepinsight/insightface/releases) \
         and copy det_10g.onnx and w600k_r50.onnx into that directory, \
         or point ROLLCALL_MODEL_DIR at a directory containing them."
    )]
    DependencyMissing { dir: PathBuf, missing: Vec<String> },
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// One face found in a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

/// Anything that turns an RGB frame into faces with embeddings.
pub trait EmbeddingProvider {
    fn faces(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<Vec<DetectedFace>, ProviderError>;
}

impl<P: EmbeddingProvider + ?Sized> EmbeddingProvider for Box<P> {
    fn faces(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<Vec<DetectedFace>, ProviderError> {
        (**self).faces(rgb, width, height)
    }
}

/// Names of required model files absent from `model_dir`.
pub fn missing_models(model_dir: &Path) -> Vec<String> {
    [DETECTOR_MODEL_FILE, RECOGNIZER_MODEL_FILE]
        .iter()
        .filter(|name| !model_dir.join(name).is_file())
        .map(|name| name.to_string())
        .collect()
}

/// Fail with install instructions unless both model files are present.
pub fn check_models(model_dir: &Path) -> Result<(), ProviderError> {
    let missing = missing_models(model_dir);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ProviderError::DependencyMissing {
            dir: model_dir.to_path_buf(),
            missing,
        })
    }
}

/// SCRFD + ArcFace provider running on ONNX Runtime.
pub struct OnnxProvider {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxProvider {
    pub fn load(model_dir: &Path) -> Result<Self, ProviderError> {
        check_models(model_dir)?;
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL_FILE))?;
        Ok(Self { detector, recognizer })
    }
}

impl EmbeddingProvider for OnnxProvider {
    fn faces(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<Vec<DetectedFace>, ProviderError> {
        let boxes = self.detector.detect(rgb, width, height)?;
        let mut faces = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            let embedding = self.recognizer.extract(rgb, width, height, &bbox)?;
            faces.push(DetectedFace { bbox, embedding });
        }
        Ok(faces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_models_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DETECTOR_MODEL_FILE), b"").unwrap();

        let err = check_models(dir.path()).unwrap_err();
        match &err {
            ProviderError::DependencyMissing { missing, .. } => {
                assert_eq!(missing, &vec![RECOGNIZER_MODEL_FILE.to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("ROLLCALL_MODEL_DIR"));
    }

    #[test]
    fn test_check_models_ok_when_present() {
        let dir = tempfile::tempdir().unwrap();
        for name in [DETECTOR_MODEL_FILE, RECOGNIZER_MODEL_FILE] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        assert!(check_models(dir.path()).is_ok());
    }
}
