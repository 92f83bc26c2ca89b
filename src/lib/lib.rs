#[macro_use]
extern crate tracing;
pub mod libvirt;
pub mod merge;
pub mod path;
pub mod settings;
pub mod structs;
pub mod template;
#[cfg(test)]
mod vm_xml;
pub mod xml_tree;

pub use merge::{apply_config, merge_config};
pub use structs::TuningConfig;
pub use xml_tree::{Document, Element, XmlError};
