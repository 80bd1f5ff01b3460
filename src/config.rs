// Parameter file for the reconstruction and bundle registration tools

use crate::bundlewarp::WarpParams;
use crate::error::Result;
use crate::shore::ShoreParams;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconParams {
    pub shore: ShoreParams,
    pub warp: WarpParams,
}

impl ReconParams {
    pub fn validate(&self) -> Result<()> {
        self.shore.validate()?;
        self.warp.validate()
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let params: Self = toml::from_str(s)?;
        params.validate()?;
        Ok(params)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        let mut s = toml::to_string(self)?;
        s.push('\n');
        Ok(s)
    }

    /// reads and validates a parameter file. The toml extension is assumed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().with_extension("toml");
        log::debug!("reading parameters from {}", path.display());
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().with_extension("toml");
        fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }
}
