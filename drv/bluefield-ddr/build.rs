// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{bail, Result};
use drv_bluefield_ddr_api::{Candidate, MSS_COUNT};
use serde::Deserialize;
use std::io::Write;

/// Longest board name the driver keeps; mirrors `board::BOARD_NAME_MAX`.
const BOARD_NAME_MAX: usize = 32;

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Config {
    #[serde(default)]
    system: Vec<System>,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct System {
    id: Option<u32>,
    name: String,
    /// Candidate name for each controller, in controller order.
    mss: [String; MSS_COUNT],
}

fn main() -> Result<()> {
    let cfg = build_util::platform_config::<Config>("systems.toml")?;

    let mut entries = String::new();
    for s in &cfg.system {
        if s.name.is_empty() || s.name.len() > BOARD_NAME_MAX {
            bail!("system name {:?} must be 1..={BOARD_NAME_MAX} bytes", s.name);
        }
        if !s.name.is_ascii() {
            bail!("system name {:?} must be ASCII", s.name);
        }
        let mut mss = Vec::with_capacity(MSS_COUNT);
        for name in &s.mss {
            let Some(c) = Candidate::from_name(name) else {
                bail!("system {:?}: unknown candidate {name:?}", s.name);
            };
            mss.push(format!("Candidate::{c:?}"));
        }
        let id = match s.id {
            Some(id) => format!("Some({id:#x})"),
            None => "None".to_string(),
        };
        entries += &format!(
            "    KnownSystem {{ id: {id}, name: {:?}, mss: [{}] }},\n",
            s.name,
            mss.join(", ")
        );
    }

    let out_dir = std::env::var("OUT_DIR")?;
    let dest_path = std::path::Path::new(&out_dir).join("known_systems.rs");
    let mut out = std::fs::File::create(&dest_path)?;
    writeln!(out, "/// Boards with a fixed memory configuration.")?;
    writeln!(out, "pub static KNOWN_SYSTEMS: &[KnownSystem] = &[")?;
    write!(out, "{entries}")?;
    writeln!(out, "];")?;
    Ok(())
}
