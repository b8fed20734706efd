use tracing::{debug, info};

use crate::model::Section;
use crate::services::image::BinaryImage;

/// Section named exactly `name`, if the image has one.
pub fn find_section(image: &dyn BinaryImage, name: &str) -> Option<Section> {
    image.sections().into_iter().find(|s| s.name == name)
}

/// Start of the first function starting inside `section` whose name contains `needle`.
///
/// The end bound is inclusive.
pub fn find_function_in_range(
    image: &dyn BinaryImage,
    section: &Section,
    needle: &str,
) -> Option<u64> {
    debug!(
        section = %section.name,
        start = format_args!("{:#x}", section.start),
        end = format_args!("{:#x}", section.end),
        "searching for '{needle}'"
    );
    let found = image
        .functions()
        .into_iter()
        .find(|f| f.start >= section.start && f.start <= section.end && f.name.contains(needle));
    if let Some(function) = &found {
        info!(name = %function.name, address = format_args!("{:#x}", function.start), "replacement found");
    }
    found.map(|f| f.start)
}

/// Address of the replacement function, or `None` when either the section
/// or a matching function is missing.
pub fn resolve_replacement(image: &dyn BinaryImage, section: &str, needle: &str) -> Option<u64> {
    let section = find_section(image, section)?;
    find_function_in_range(image, &section, needle)
}
