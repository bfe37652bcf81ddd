//! SPIR-V binary loading and shader module creation.
//!
//! Shader binaries are opaque blobs to this crate; the only validation done
//! here is structural (magic number, word alignment). The binding contract
//! lives in `pipeline.rs` and `denoiser.rs` and must match the shader source.

use ash::vk;
use std::fs;
use std::path::Path;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Read a SPIR-V binary and return it as a word vector.
pub fn load_spirv(path: &Path) -> Result<Vec<u32>, String> {
    let bytes = fs::read(path).map_err(|e| format!("Failed to read shader {:?}: {}", path, e))?;

    if bytes.len() < 4 || bytes.len() % 4 != 0 {
        return Err(format!(
            "{:?}: size {} is not a valid SPIR-V word stream",
            path,
            bytes.len()
        ));
    }

    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    if words[0] != SPIRV_MAGIC {
        return Err(format!(
            "{:?}: bad SPIR-V magic 0x{:08X} (expected 0x{:08X})",
            path, words[0], SPIRV_MAGIC
        ));
    }

    Ok(words)
}

/// Create a shader module from SPIR-V words.
pub fn create_shader_module(
    device: &ash::Device,
    code: &[u32],
) -> Result<vk::ShaderModule, String> {
    let create_info = vk::ShaderModuleCreateInfo::default().code(code);
    unsafe {
        device
            .create_shader_module(&create_info, None)
            .map_err(|e| format!("Failed to create shader module: {:?}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn rejects_truncated_and_misaligned_files() {
        let dir = std::env::temp_dir();

        let short = dir.join("pathlight_short.spv");
        fs::File::create(&short).unwrap().write_all(&[1, 2]).unwrap();
        assert!(load_spirv(&short).is_err());

        let misaligned = dir.join("pathlight_misaligned.spv");
        fs::File::create(&misaligned)
            .unwrap()
            .write_all(&[0x03, 0x02, 0x23, 0x07, 0xFF])
            .unwrap();
        assert!(load_spirv(&misaligned).is_err());
    }

    #[test]
    fn rejects_bad_magic_and_accepts_good_magic() {
        let dir = std::env::temp_dir();

        let bad = dir.join("pathlight_badmagic.spv");
        fs::File::create(&bad)
            .unwrap()
            .write_all(&0xDEAD_BEEFu32.to_le_bytes())
            .unwrap();
        assert!(load_spirv(&bad).is_err());

        let good = dir.join("pathlight_goodmagic.spv");
        let mut f = fs::File::create(&good).unwrap();
        f.write_all(&SPIRV_MAGIC.to_le_bytes()).unwrap();
        f.write_all(&0u32.to_le_bytes()).unwrap();
        let words = load_spirv(&good).unwrap();
        assert_eq!(words[0], SPIRV_MAGIC);
        assert_eq!(words.len(), 2);
    }
}
