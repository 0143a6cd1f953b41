//! Trained model halves
//!
//! Each party keeps only its own coefficients; a prediction needs both
//! halves. Standardization statistics travel with the model so raw rows can
//! be scored later.

use super::dataset::DataSet;
use super::params::Algorithm;
use super::preprocess;
use crate::error::{DcpError, Result};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Key of the bias coefficient in `thetas`
pub const INTERCEPT: &str = "intercept";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub algorithm: Algorithm,
    pub thetas: BTreeMap<String, f64>,
    pub xbars: BTreeMap<String, f64>,
    pub sigmas: BTreeMap<String, f64>,
    /// Feature order used during training
    pub features: Vec<String>,
    pub label: Option<String>,
    pub label_name: Option<String>,
    pub is_tag_part: bool,
    pub id_name: String,
    /// Rounds actually run
    pub rounds: u64,
    pub final_cost: f64,
}

impl Model {
    /// Assemble from a coefficient vector whose first entry is the bias
    #[allow(clippy::too_many_arguments)]
    pub fn from_theta(
        algorithm: Algorithm,
        theta: &DVector<f64>,
        features: &[String],
        xbars: &[f64],
        sigmas: &[f64],
        label: Option<(&str, f64, f64)>,
        label_name: Option<String>,
        id_name: &str,
    ) -> Self {
        let mut thetas = BTreeMap::new();
        thetas.insert(INTERCEPT.to_string(), theta[0]);
        let mut xb = BTreeMap::new();
        let mut sg = BTreeMap::new();
        for (j, name) in features.iter().enumerate() {
            thetas.insert(name.clone(), theta[j + 1]);
            xb.insert(name.clone(), xbars[j]);
            sg.insert(name.clone(), sigmas[j]);
        }
        if let Some((name, mean, std)) = label {
            xb.insert(name.to_string(), mean);
            sg.insert(name.to_string(), std);
        }
        Self {
            algorithm,
            thetas,
            xbars: xb,
            sigmas: sg,
            features: features.to_vec(),
            label: label.map(|(n, _, _)| n.to_string()),
            label_name,
            is_tag_part: label.is_some(),
            id_name: id_name.to_string(),
            rounds: 0,
            final_cost: f64::NAN,
        }
    }

    /// Coefficients in training order, bias first
    pub fn theta_vector(&self) -> Result<DVector<f64>> {
        let mut out = Vec::with_capacity(self.features.len() + 1);
        out.push(self.coefficient(INTERCEPT)?);
        for f in &self.features {
            out.push(self.coefficient(f)?);
        }
        Ok(DVector::from_vec(out))
    }

    fn coefficient(&self, name: &str) -> Result<f64> {
        self.thetas
            .get(name)
            .copied()
            .ok_or_else(|| DcpError::Param(format!("model has no coefficient for {:?}", name)))
    }

    fn stats(&self) -> Result<(Vec<f64>, Vec<f64>)> {
        let get = |map: &BTreeMap<String, f64>, f: &String| {
            map.get(f)
                .copied()
                .ok_or_else(|| DcpError::Param(format!("model has no statistics for {:?}", f)))
        };
        let xbars = self.features.iter().map(|f| get(&self.xbars, f)).collect::<Result<_>>()?;
        let sigmas = self.features.iter().map(|f| get(&self.sigmas, f)).collect::<Result<_>>()?;
        Ok((xbars, sigmas))
    }

    /// This half's contribution `u = X·θ` for each row of `ds`
    pub fn partial_scores(&self, ds: &DataSet) -> Result<Vec<f64>> {
        if ds.features != self.features {
            return Err(DcpError::GetPredictSet(format!(
                "prediction columns {:?} differ from training columns {:?}",
                ds.features, self.features
            )));
        }
        let (xbars, sigmas) = self.stats()?;
        let x = preprocess::design_matrix(ds, &xbars, &sigmas)?;
        let u = x * self.theta_vector()?;
        Ok(u.iter().copied().collect())
    }

    /// Combine both halves' scores into final predictions (tag party only).
    ///
    /// Logistic models yield probabilities; linear models yield values on
    /// the original label scale.
    pub fn finish_scores(&self, own: &[f64], peer: &[f64]) -> Result<Vec<f64>> {
        if own.len() != peer.len() {
            return Err(DcpError::GetPredictSet(format!(
                "score length mismatch: {} vs {}",
                own.len(),
                peer.len()
            )));
        }
        let label = self
            .label
            .as_ref()
            .ok_or_else(|| DcpError::Param("only the label party can finish predictions".into()))?;
        let z = own.iter().zip(peer.iter()).map(|(a, b)| a + b);
        match self.algorithm {
            Algorithm::LogRegVL => Ok(z.map(sigmoid).collect()),
            Algorithm::LinRegVL => {
                let mean = self.xbars.get(label).copied().unwrap_or(0.0);
                let std = self.sigmas.get(label).copied().unwrap_or(1.0);
                Ok(z.map(|v| v * std + mean).collect())
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| DcpError::NotFound(format!("model {}: {}", path.display(), e)))?;
        Ok(serde_json::from_str(&json)?)
    }
}

pub fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature_model() -> Model {
        Model::from_theta(
            Algorithm::LinRegVL,
            &DVector::from_vec(vec![0.5, 2.0]),
            &["a".to_string()],
            &[1.0],
            &[2.0],
            None,
            None,
            "id",
        )
    }

    #[test]
    fn test_partial_scores_use_statistics() {
        let m = feature_model();
        let ds = DataSet {
            id_name: "id".into(),
            ids: vec!["1".into()],
            features: vec!["a".into()],
            rows: vec![vec![5.0]],
            label: None,
            labels: None,
        };
        // 0.5 + 2 * (5 - 1) / 2
        assert_eq!(m.partial_scores(&ds).unwrap(), vec![4.5]);
    }

    #[test]
    fn test_finish_scores_linear_destandardizes() {
        let m = Model::from_theta(
            Algorithm::LinRegVL,
            &DVector::from_vec(vec![0.0]),
            &[],
            &[],
            &[],
            Some(("y", 10.0, 2.0)),
            None,
            "id",
        );
        assert_eq!(m.finish_scores(&[0.5], &[0.5]).unwrap(), vec![12.0]);
        assert!(feature_model().finish_scores(&[0.0], &[0.0]).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let m = feature_model();
        let path = std::env::temp_dir()
            .join(format!("dcp-model-{}", uuid::Uuid::new_v4()))
            .join("model.json");
        m.save(&path).unwrap();
        let loaded = Model::load(&path).unwrap();
        assert_eq!(loaded.thetas, m.thetas);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_sigmoid() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-12);
        assert!(sigmoid(10.0) > 0.99);
    }
}
