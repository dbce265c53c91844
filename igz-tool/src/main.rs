use anyhow::{bail, Context, Result};
use clap::{Parser as ClapParser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use igz_core::{FixupKind, Igz, StaticTypeRegistry};

#[derive(Debug, Serialize)]
pub struct ChunkSummary {
    index: usize,
    offset: u32,
    size: u32,
}

#[derive(Debug, Serialize)]
pub struct FixupSummary {
    kind: String,
    items: u32,
    bytes: u32,
}

#[derive(Debug, Serialize)]
pub struct ObjectSummary {
    id: usize,
    offset: u32,
    size: u32,
    type_name: String,
    name: Option<String>,
    live_slots: usize,
}

#[derive(Debug, Serialize)]
pub struct ContainerSummary {
    version: u32,
    file_kind: Option<u32>,
    chunks: Vec<ChunkSummary>,
    fixups: Vec<FixupSummary>,
    objects: Vec<ObjectSummary>,
}

fn load_registry(path: Option<&Path>) -> Result<Arc<StaticTypeRegistry>> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .context(format!("unable to read type registry: {:?}", path))?;
            let registry: StaticTypeRegistry =
                serde_yaml::from_str(&text).context("malformed type registry")?;
            Ok(Arc::new(registry))
        }
        // graph derivation works from the fixups alone, so an empty
        // registry is still useful for inspection
        None => Ok(Arc::new(StaticTypeRegistry::new())),
    }
}

fn load_container(input: &Path, types: Option<&Path>) -> Result<Igz> {
    let bytes = std::fs::read(input).context(format!("unable to read: {:?}", input))?;
    let registry = load_registry(types)?;
    let igz = Igz::parse(&bytes, registry).context("cannot open container")?;
    Ok(igz)
}

fn summarize(igz: &Igz) -> ContainerSummary {
    ContainerSummary {
        version: igz.version(),
        file_kind: igz.trailer().map(|t| t.file_kind),
        chunks: igz
            .chunks()
            .iter()
            .enumerate()
            .map(|(index, c)| ChunkSummary {
                index,
                offset: c.offset,
                size: c.size,
            })
            .collect(),
        fixups: igz
            .fixups()
            .active()
            .map(|t| FixupSummary {
                kind: t.kind().to_string(),
                items: t.item_count(),
                bytes: t.byte_size(),
            })
            .collect(),
        objects: igz
            .objects()
            .map(|o| ObjectSummary {
                id: o.id().0,
                offset: o.relative_offset(),
                size: o.size(),
                type_name: o.type_name().to_string(),
                name: o.name().map(str::to_owned),
                live_slots: o.live_slots().len(),
            })
            .collect(),
    }
}

fn cmd_info(input: &Path, types: Option<&Path>) -> Result<()> {
    let igz = load_container(input, types)?;
    let summary = summarize(&igz);
    print!("{}", serde_yaml::to_string(&summary)?);
    Ok(())
}

fn cmd_verify(input: &Path, types: Option<&Path>) -> Result<()> {
    let bytes = std::fs::read(input).context(format!("unable to read: {:?}", input))?;
    let igz = Igz::parse(&bytes, load_registry(types)?)?;
    let out = igz.serialize()?;
    if out == bytes {
        println!("{}: byte-exact roundtrip ({} bytes)", input.display(), bytes.len());
        return Ok(());
    }
    let first_diff = out
        .iter()
        .zip(bytes.iter())
        .position(|(a, b)| a != b)
        .unwrap_or(out.len().min(bytes.len()));
    bail!(
        "{}: roundtrip mismatch, first difference at {:#x} ({} vs {} bytes)",
        input.display(),
        first_diff,
        out.len(),
        bytes.len()
    );
}

fn cmd_graph(input: &Path, types: Option<&Path>) -> Result<()> {
    let mut igz = load_container(input, types)?;
    igz.derive_graph()?;
    for obj in igz.objects() {
        let label = match obj.name() {
            Some(name) => format!("{} {:?} ({})", obj.id(), name, obj.type_name()),
            None => format!("{} ({})", obj.id(), obj.type_name()),
        };
        let flag = if obj.is_invalid() { " [invalid]" } else { "" };
        println!("{}{}", label, flag);
        for edge in igz.children_of(obj.id())? {
            let kind = match edge.kind {
                FixupKind::Rhnd => "handle",
                _ => "pointer",
            };
            println!("  +{:#06x} {} -> {}", edge.local_offset, kind, edge.child);
        }
    }
    Ok(())
}

#[derive(ClapParser, Debug)]
#[command(version, about = "Inspect and verify IGZ object containers", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Dump a YAML summary of chunks, fixup tables and objects
    Info {
        input: PathBuf,
        /// YAML type registry for field-level interpretation
        #[arg(short, long)]
        types: Option<PathBuf>,
    },
    /// Re-serialize and compare byte for byte against the input
    Verify {
        input: PathBuf,
        #[arg(short, long)]
        types: Option<PathBuf>,
    },
    /// Derive and print the object reference graph
    Graph {
        input: PathBuf,
        #[arg(short, long)]
        types: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    match &args.command {
        Command::Info { input, types } => cmd_info(input, types.as_deref()),
        Command::Verify { input, types } => cmd_verify(input, types.as_deref()),
        Command::Graph { input, types } => cmd_graph(input, types.as_deref()),
    }
}
