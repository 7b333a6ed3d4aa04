use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::recipe::Recipe;

const HEADER: &str = "\
# diagnosis-etl recipe. Paths are relative to the working directory.
# Run with: diagnosis-etl run --recipe <this file>
";

/// Render `recipe` as YAML with a short header comment.
pub fn render_recipe(recipe: &Recipe) -> Result<String> {
    Ok(format!("{HEADER}{}", recipe.to_yaml()?))
}

/// Write the default recipe to `destination`, creating parent directories.
pub fn generate_recipe(destination: &Path) -> Result<PathBuf> {
    let rendered = render_recipe(&Recipe::default())?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered)
        .with_context(|| format!("Failed to write recipe: {}", destination.display()))?;

    Ok(destination.to_path_buf())
}
