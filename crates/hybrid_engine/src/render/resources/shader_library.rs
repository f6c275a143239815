//! SPIR-V shader words keyed by name
//!
//! Shaders are compiled ahead of time; the library only loads `<name>.spv`
//! files and checks the SPIR-V magic number. A missing shader is a startup
//! error, never a per-frame one.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use crate::foundation::logging::{debug, info};
use crate::render::RenderError;

/// First word of every SPIR-V module
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Shaders the renderer's three passes need
pub const REQUIRED_SHADERS: &[&str] = &[
    "envmap.vert",
    "envmap.frag",
    "entity.vert",
    "entity.frag",
    "raytrace.rgen",
    "raytrace.rmiss",
    "shadow.rmiss",
    "raytrace.rchit",
];

/// Loaded SPIR-V modules
#[derive(Debug, Default, Clone)]
pub struct ShaderLibrary {
    shaders: HashMap<String, Vec<u32>>,
}

impl ShaderLibrary {
    /// Load `<name>.spv` for every name from `directory`
    pub fn load_directory<P: AsRef<Path>>(directory: P, names: &[&str]) -> Result<Self, RenderError> {
        let directory = directory.as_ref();
        let mut library = Self::default();
        for name in names {
            let path = directory.join(format!("{name}.spv"));
            let mut file = File::open(&path)
                .map_err(|e| RenderError::MissingShader(format!("{}: {e}", path.display())))?;
            let words = ash::util::read_spv(&mut file)
                .map_err(|e| RenderError::InvalidShader(format!("{}: {e}", path.display())))?;
            debug!("[SHADER] Loaded {} ({} words)", path.display(), words.len());
            library.insert(name, words)?;
        }
        info!("[SHADER] {} shaders loaded from {}", library.len(), directory.display());
        Ok(library)
    }

    /// Library of minimal valid modules (magic number only), for devices that
    /// never compile shaders such as the headless backend
    pub fn stub(names: &[&str]) -> Self {
        Self {
            shaders: names
                .iter()
                .map(|name| ((*name).to_string(), vec![SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]))
                .collect(),
        }
    }

    /// Add or replace a module
    pub fn insert(&mut self, name: &str, words: Vec<u32>) -> Result<(), RenderError> {
        if words.first() != Some(&SPIRV_MAGIC) {
            return Err(RenderError::InvalidShader(format!("{name} is not SPIR-V")));
        }
        self.shaders.insert(name.to_string(), words);
        Ok(())
    }

    /// Words of a module
    pub fn get(&self, name: &str) -> Result<&[u32], RenderError> {
        self.shaders
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| RenderError::MissingShader(name.to_string()))
    }

    /// Number of modules
    pub fn len(&self) -> usize {
        self.shaders.len()
    }

    /// Whether the library is empty
    pub fn is_empty(&self) -> bool {
        self.shaders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_covers_required_shaders() {
        let library = ShaderLibrary::stub(REQUIRED_SHADERS);
        assert_eq!(library.len(), REQUIRED_SHADERS.len());
        for name in REQUIRED_SHADERS {
            assert_eq!(library.get(name).unwrap()[0], SPIRV_MAGIC);
        }
    }

    #[test]
    fn test_missing_shader_is_reported_by_name() {
        let library = ShaderLibrary::stub(&["a.vert"]);
        match library.get("b.frag") {
            Err(RenderError::MissingShader(name)) => assert_eq!(name, "b.frag"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_non_spirv_words_are_rejected() {
        let mut library = ShaderLibrary::default();
        assert!(library.insert("bad", vec![0xDEAD_BEEF]).is_err());
        assert!(library.is_empty());
    }

    #[test]
    fn test_loading_from_missing_directory_fails() {
        let result = ShaderLibrary::load_directory("/nonexistent/shader/dir", &["envmap.vert"]);
        assert!(matches!(result, Err(RenderError::MissingShader(_))));
    }
}
