// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::env;
use std::path::Path;

/// Environment variable that, when set, carries the platform configuration
/// as TOML text and takes precedence over the checked-in default file.
pub const PLATFORM_CONFIG_VAR: &str = "BF_PLATFORM_CONFIG";

///
/// Pulls the platform configuration for purposes of a build script.
///
/// If `BF_PLATFORM_CONFIG` is set, its contents are parsed; otherwise the
/// file at `default_path` (relative to the calling crate's manifest) is.
/// As with any serde subset, `T` should contain only the parts the caller
/// cares about and must not set `deny_unknown_fields` at the top level.
///
pub fn platform_config<T: DeserializeOwned>(default_path: &str) -> Result<T> {
    println!("cargo:rerun-if-env-changed={PLATFORM_CONFIG_VAR}");
    if let Ok(text) = env::var(PLATFORM_CONFIG_VAR) {
        println!("--- toml for ${PLATFORM_CONFIG_VAR} ---");
        println!("{text}");
        return parse(&text, PLATFORM_CONFIG_VAR);
    }

    let dir = env::var("CARGO_MANIFEST_DIR")?;
    let path = Path::new(&dir).join(default_path);
    println!("cargo:rerun-if-changed={}", path.display());
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse(&text, &path.display().to_string())
}

fn parse<T: DeserializeOwned>(text: &str, origin: &str) -> Result<T> {
    toml::from_str(text).with_context(|| format!("parsing {origin}"))
}
