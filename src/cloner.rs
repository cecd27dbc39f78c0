/* The cloning pipeline.
 *
 * One strictly sequential pass: read source -> rewrite manifest -> patch
 * bytecode -> merge interception stubs -> repack -> sign -> write output.
 * Intermediate artifacts live in a uniquely named scratch directory that is
 * removed on every exit path. Progress goes to a caller-supplied sink as
 * (step description, percent), non-decreasing with a terminal 100.
 */

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info, warn};

use crate::apk::manifest;
use crate::apk::zip::ApkFile;
use crate::config::CloneConfig;
use crate::dex::merge::merge_into;
use crate::dex::pool::DexPool;
use crate::error::{CloneError, CloneResult};
use crate::hook::patch::{patch_dex, PatchOutcome};
use crate::hook::stubs;
use crate::sign::keystore::KeyProvider;
use crate::sign::sign_apk;

const MANIFEST_ENTRY: &str = "AndroidManifest.xml";
const PRIMARY_DEX: &str = "classes.dex";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneOutcome {
    pub apk_path: PathBuf,
    pub clone_package: String,
}

pub struct ClonePipeline<'k> {
    config: CloneConfig,
    keys: &'k dyn KeyProvider,
}

/// Scratch directory removed when the pipeline leaves scope.
struct ScratchDir {
    path: PathBuf,
}

static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

impl ScratchDir {
    fn create() -> CloneResult<Self> {
        let unique = format!(
            "apkclone-{}-{}",
            std::process::id(),
            SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let path = std::env::temp_dir().join(unique);
        std::fs::create_dir_all(&path).map_err(|err| CloneError::resource(&path, err))?;
        Ok(ScratchDir { path })
    }

    fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_dir_all(&self.path) {
            warn!("could not remove scratch dir {}: {}", self.path.display(), err);
        }
    }
}

fn is_dex_entry(name: &str) -> bool {
    if name == PRIMARY_DEX {
        return true;
    }
    name.strip_prefix("classes")
        .and_then(|rest| rest.strip_suffix(".dex"))
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

impl<'k> ClonePipeline<'k> {
    pub fn new(config: CloneConfig, keys: &'k dyn KeyProvider) -> Self {
        ClonePipeline { config, keys }
    }

    fn validate(&self) -> CloneResult<()> {
        let path = &self.config.source_apk;
        let meta = std::fs::metadata(path).map_err(|_| {
            CloneError::InvalidInput(format!("source container {} is not readable", path.display()))
        })?;
        if !meta.is_file() || meta.len() == 0 {
            return Err(CloneError::InvalidInput(format!(
                "source container {} is empty or not a file",
                path.display()
            )));
        }
        if self.config.source_package.is_empty() || self.config.clone_package.is_empty() {
            return Err(CloneError::InvalidInput("package names must be non-empty".to_string()));
        }
        if self.config.source_package == self.config.clone_package {
            return Err(CloneError::InvalidInput(
                "clone package must differ from the source package".to_string(),
            ));
        }
        Ok(())
    }

    /// Runs the whole pipeline. `progress` receives (step, percent).
    pub fn run(&self, progress: &mut dyn FnMut(&str, u8)) -> CloneResult<CloneOutcome> {
        self.validate()?;
        let scratch = ScratchDir::create()?;

        progress("reading source container", 5);
        let mut apk = ApkFile::from_file(&self.config.source_apk)?;
        if apk.entry_names().next().is_none() {
            return Err(CloneError::InvalidInput("source container has no entries".to_string()));
        }

        progress("rewriting manifest", 20);
        let manifest_bytes = apk
            .entry(MANIFEST_ENTRY)
            .ok_or_else(|| CloneError::InvalidInput("source has no manifest".to_string()))?
            .uncompressed()?;
        let rewritten = manifest::rewrite_package(
            &manifest_bytes,
            &self.config.source_package,
            &self.config.clone_package,
        )?;
        apk.replace_entry(MANIFEST_ENTRY, rewritten)?;

        if self.config.enable_interception {
            progress("patching bytecode", 40);
            self.patch_bytecode(&mut apk)?;
        } else {
            debug!("interception disabled, bytecode left untouched");
        }

        progress("repacking container", 70);
        let unsigned = scratch.file("unsigned.apk");
        apk.write_to_file(&unsigned).map_err(CloneError::Archive)?;
        let repacked =
            std::fs::read(&unsigned).map_err(|err| CloneError::resource(&unsigned, err))?;
        let repacked = ApkFile::from_bytes(&repacked)?;

        progress("signing", 85);
        let material = self.keys.signing_material()?;
        let signed = sign_apk(repacked, &material)?;
        if signed.is_empty() {
            return Err(CloneError::Signing(crate::sign::SignError::Key(
                "signer produced no output".to_string(),
            )));
        }

        std::fs::create_dir_all(&self.config.output_dir)
            .map_err(|err| CloneError::resource(&self.config.output_dir, err))?;
        let apk_path = self
            .config
            .output_dir
            .join(format!("{}.apk", self.config.clone_package));
        std::fs::write(&apk_path, &signed).map_err(|err| CloneError::resource(&apk_path, err))?;

        info!(
            "cloned {} as {} at {}",
            self.config.source_package,
            self.config.clone_package,
            apk_path.display()
        );
        progress("done", 100);
        Ok(CloneOutcome { apk_path, clone_package: self.config.clone_package.clone() })
    }

    /// Redirects hooked calls in every bytecode file and merges the stub
    /// classes into the primary one. Secondary files fall back to their
    /// original bytes on failure; the primary file must come out usable.
    fn patch_bytecode(&self, apk: &mut ApkFile) -> CloneResult<()> {
        let dex_names: Vec<String> = apk
            .entry_names()
            .filter(|n| is_dex_entry(n))
            .map(|n| n.to_string())
            .collect();
        if !dex_names.iter().any(|n| n == PRIMARY_DEX) {
            return Err(CloneError::InvalidInput(format!(
                "source has no {PRIMARY_DEX}"
            )));
        }

        for name in &dex_names {
            let bytes = apk
                .entry(name)
                .ok_or_else(|| CloneError::InvalidInput(format!("missing entry '{name}'")))?
                .uncompressed()?;

            if name == PRIMARY_DEX {
                // the stub classes land here, so this file must parse
                let mut pool = DexPool::parse(&bytes).map_err(CloneError::PrimaryDex)?;
                crate::hook::patch::patch_pool(&mut pool);
                let stub_pool =
                    stubs::stub_pool(&self.config.identity_json(), &self.config.clone_package);
                let dropped = merge_into(&mut pool, stub_pool);
                if dropped > 0 {
                    debug!("{} stub class(es) already present", dropped);
                }
                let rebuilt = pool.build().map_err(CloneError::PrimaryDex)?;
                apk.replace_entry(name, rebuilt)?;
            } else {
                match patch_dex(name, bytes) {
                    PatchOutcome::Patched(patched) => apk.replace_entry(name, patched)?,
                    PatchOutcome::Original(_) => {}
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dex_entry_names() {
        assert!(is_dex_entry("classes.dex"));
        assert!(is_dex_entry("classes2.dex"));
        assert!(is_dex_entry("classes17.dex"));
        assert!(!is_dex_entry("classes.dex.bak"));
        assert!(!is_dex_entry("assets/classes.dex"));
        assert!(!is_dex_entry("classesX.dex"));
    }

    #[test]
    fn scratch_dirs_are_unique_and_removed() {
        let first = ScratchDir::create().unwrap();
        let second = ScratchDir::create().unwrap();
        assert_ne!(first.path, second.path);
        let path = first.path.clone();
        assert!(path.exists());
        drop(first);
        assert!(!path.exists());
    }
}
