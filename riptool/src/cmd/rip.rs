use std::{fs::DirBuilder, path::PathBuf};

use anyhow::{Context, Result};
use argh::FromArgs;
use riplib::{
    format::{rip::RipModel, txtr::STextureParams},
    util::file::map_file,
};

#[derive(FromArgs, PartialEq, Debug)]
/// process rip dumps
#[argh(subcommand, name = "rip")]
pub struct Args {
    #[argh(subcommand)]
    command: SubCommand,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
enum SubCommand {
    Info(InfoArgs),
    Textures(TexturesArgs),
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// displays information about a rip dump
#[argh(subcommand, name = "info")]
pub struct InfoArgs {
    #[argh(positional)]
    /// input dump
    input: PathBuf,
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// decodes all material textures to PNG
#[argh(subcommand, name = "textures")]
pub struct TexturesArgs {
    #[argh(positional)]
    /// input dump
    input: PathBuf,
    #[argh(positional)]
    /// output directory
    out_dir: PathBuf,
}

pub fn run(args: Args) -> Result<()> {
    match args.command {
        SubCommand::Info(c_args) => info(c_args),
        SubCommand::Textures(c_args) => textures(c_args),
    }
}

fn info(args: InfoArgs) -> Result<()> {
    let data = map_file(&args.input)?;
    let model = RipModel::parse(&data)?;
    log::info!("Dump info:");
    log::info!("  Vertices: {}", model.positions.len());
    log::info!("  Triangles: {}", model.tri_indices.len() / 3);
    log::info!("  Quads: {}", model.quad_indices.len() / 4);
    log::info!("  Materials: {}", model.materials.len());
    for (index, material) in model.materials.iter().enumerate() {
        let params = STextureParams::from_texparam(material.key.texparam);
        match &material.texture {
            Some(texture) => log::info!(
                "  Material {}: {} {}x{}{}",
                index,
                params.format,
                texture.width,
                texture.height,
                if texture.is_opaque { ", opaque" } else { "" }
            ),
            None => log::info!("  Material {index}: untextured"),
        }
    }
    Ok(())
}

fn textures(args: TexturesArgs) -> Result<()> {
    let data = map_file(&args.input)?;
    let model = RipModel::parse(&data)?;
    DirBuilder::new()
        .recursive(true)
        .create(&args.out_dir)
        .with_context(|| format!("Failed to create directory '{}'", args.out_dir.display()))?;
    for (index, material) in model.materials.iter().enumerate() {
        let texture = match &material.texture {
            Some(texture) => texture,
            None => {
                log::info!("Material {index} is untextured, skipping");
                continue;
            }
        };
        let path = args.out_dir.join(format!("material_{index}.png"));
        let image = texture.clone().into_image()?;
        image.save(&path).with_context(|| format!("Failed to write '{}'", path.display()))?;
        log::info!("Wrote {}", path.display());
    }
    Ok(())
}
