//! Image enumeration over the two-level `<root>/<class>/<file>` layout shared
//! by every supported dataset.

use crate::error::Result;
use crate::{DatasetName, Split};
use std::fs;
use std::path::{Path, PathBuf};
use vision_kit_common::utils::is_image_file;

/// List image files laid out as `<root>/<class>/<file>`, sorted by path.
///
/// A missing root yields an empty list rather than an error; datasets without
/// a `val` or `test` split are handled this way.
pub fn list_class_images(root: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();

    if !root.is_dir() {
        return Ok(paths);
    }

    for entry in fs::read_dir(root)? {
        let class_path = entry?.path();
        if !class_path.is_dir() {
            continue;
        }

        for image_entry in fs::read_dir(&class_path)? {
            let image_path = image_entry?.path();
            if image_path.is_file() && is_image_file(&image_path) {
                paths.push(image_path);
            }
        }
    }

    paths.sort();
    Ok(paths)
}

/// List the image files of one split under the dataset root.
pub fn list_split_images(root: &Path, split: Split) -> Result<Vec<PathBuf>> {
    list_class_images(&root.join(split.to_string()))
}

/// Directory that receives one image's generated masks:
/// `<out_root>/<class>/<stem>`. Its existence marks the image as already
/// segmented.
pub fn mask_output_dir(out_root: &Path, image_path: &Path) -> PathBuf {
    let mut dir = out_root.to_path_buf();
    if let Some(class) = image_path.parent().and_then(Path::file_name) {
        dir.push(class);
    }
    if let Some(stem) = image_path.file_stem() {
        dir.push(stem);
    }
    dir
}

/// Build the segmentation worklist for a dataset.
///
/// When `check_existing` is set, images whose mask output directory already
/// exists under `out_root` are dropped from the list.
pub fn segmentation_worklist(
    dataset: DatasetName,
    data_root: &Path,
    out_root: &Path,
    check_existing: bool,
) -> Result<Vec<PathBuf>> {
    let root = dataset.segmentation_root(data_root)?;
    let mut paths = list_class_images(&root)?;

    if check_existing {
        let before = paths.len();
        paths.retain(|path| !mask_output_dir(out_root, path).exists());

        let skipped = before - paths.len();
        if skipped > 0 {
            log::info!("Skipping {skipped} already-segmented images for {dataset}");
        }
    }

    Ok(paths)
}
