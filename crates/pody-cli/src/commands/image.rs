//! `pody image`: Browse and delete images.

use clap::{Args, Subcommand};
use pody_common::size::format_bytes;
use pody_image::registry::{ImageKind, ImageView};

use super::{Context, Reported};
use crate::output;

/// Image subcommands.
#[derive(Subcommand, Debug)]
pub enum ImageCommand {
    /// List base images and the caller's committed images.
    List,
    /// Show one image.
    Inspect(ImageArgs),
    /// Delete a committed image.
    Delete(ImageArgs),
}

/// An image reference.
#[derive(Args, Debug)]
pub struct ImageArgs {
    /// Image name as shown by `image list`.
    pub image: String,
}

/// Executes an `image` subcommand.
///
/// # Errors
///
/// Returns an error if authentication or the operation fails.
pub fn execute(ctx: &Context, cmd: ImageCommand) -> anyhow::Result<()> {
    let caller = ctx.caller()?;
    let admin = caller.is_admin;
    match cmd {
        ImageCommand::List => {
            let images = ctx.service.list_images(&caller).reported(admin)?;
            if ctx.json {
                return output::print_json(&images);
            }
            let rows: Vec<Vec<String>> = images.iter().map(row).collect();
            output::print_table(&["NAME", "KIND", "OWNER", "SIZE", "CREATED"], &rows);
            Ok(())
        }
        ImageCommand::Inspect(args) => {
            let image = ctx.service.inspect_image(&caller, &args.image).reported(admin)?;
            if ctx.json {
                return output::print_json(&image);
            }
            let ports: Vec<&str> = image.exposed_ports.iter().map(String::as_str).collect();
            let rows = vec![
                vec!["name".into(), image.name.clone()],
                vec!["image".into(), image.image.clone()],
                vec!["id".into(), image.id.clone()],
                vec!["kind".into(), kind_label(image.kind).into()],
                vec!["owner".into(), image.owner.clone().unwrap_or_default()],
                vec!["size".into(), format_bytes(image.size)],
                vec!["ports".into(), ports.join(", ")],
                vec!["comment".into(), image.comment.clone()],
                vec!["created".into(), image.created.to_rfc3339()],
            ];
            output::print_table(&["FIELD", "VALUE"], &rows);
            Ok(())
        }
        ImageCommand::Delete(args) => {
            ctx.service.delete_image(&caller, &args.image).reported(admin)?;
            tracing::info!(image = %args.image, "image deleted");
            if ctx.json {
                return output::print_json(&serde_json::json!({ "deleted": args.image }));
            }
            println!("image {} deleted", args.image);
            Ok(())
        }
    }
}

const fn kind_label(kind: ImageKind) -> &'static str {
    match kind {
        ImageKind::Base => "base",
        ImageKind::Committed => "committed",
    }
}

fn row(image: &ImageView) -> Vec<String> {
    vec![
        image.name.clone(),
        kind_label(image.kind).into(),
        image.owner.clone().unwrap_or_else(|| "-".into()),
        format_bytes(image.size),
        image.created.format("%Y-%m-%d %H:%M").to_string(),
    ]
}
