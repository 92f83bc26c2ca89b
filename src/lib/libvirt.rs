use anyhow::{bail, Context, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::str::FromStr;
use virt::connect::Connect;

use crate::structs::{Cell, HostCpu, PageInfo};

const CELLS_PATH: &[&str] = &["capabilities", "host", "topology", "cells"];

/// Reads the NUMA layout of the host behind `uri`.
pub fn host_topology(uri: &str) -> Result<Vec<Cell>> {
    let conn = connect_libvirt(uri)?;
    let caps = match conn.get_capabilities() {
        Ok(caps) => caps,
        Err(e) => {
            disconnect(conn);
            bail!("Unable to get host capabilities: {e}");
        }
    };
    disconnect(conn);
    let cells = parse_capabilities(&caps)?;
    info!("Found {} NUMA cells.", cells.len());
    Ok(cells)
}

fn connect_libvirt(uri: &str) -> Result<Connect> {
    debug!("About to connect to {uri}");
    match Connect::open(Some(uri)) {
        Ok(c) => Ok(c),
        Err(e) => {
            error!("Can't connect to libvirt: {e}");
            bail!("Couldn't connect to libvirt at {uri}");
        }
    }
}

fn disconnect(mut conn: Connect) {
    if let Err(e) = conn.close() {
        error!("Failed to disconnect from libvirt: {e}");
    };
    debug!("Disconnected from libvirt");
}

/// Extracts the `host/topology/cells` part of a capabilities document.
pub fn parse_capabilities(xml: &str) -> Result<Vec<Cell>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<String> = vec![];
    let mut cells: Vec<Cell> = vec![];
    let mut cell: Option<Cell> = None;
    // unit of the cell memory, size of the page pool being read
    let mut memory_unit = String::from("KiB");
    let mut page_size_kib: Option<u64> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                let name = element_name(e);
                open_element(&stack, &name, e, &mut cell, &mut memory_unit, &mut page_size_kib)?;
                stack.push(name);
            }
            Ok(Event::Empty(ref e)) => {
                let name = element_name(e);
                open_element(&stack, &name, e, &mut cell, &mut memory_unit, &mut page_size_kib)?;
                if name == "cell" && at(&stack, CELLS_PATH) {
                    cells.extend(cell.take());
                }
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().unwrap_or_default().to_string();
                let Some(current) = cell.as_mut() else {
                    continue;
                };
                if at_cell_child(&stack, "memory") {
                    let amount: u64 = text
                        .parse()
                        .with_context(|| format!("invalid memory amount {text:?} in cell {}", current.id))?;
                    current.memory_kib = to_kib(amount, &memory_unit);
                } else if at_cell_child(&stack, "pages") {
                    if let Some(size_kib) = page_size_kib.take() {
                        let count = text
                            .parse()
                            .with_context(|| format!("invalid page count {text:?} in cell {}", current.id))?;
                        current.pages.push(PageInfo { size_kib, count });
                    }
                }
            }
            Ok(Event::End(_)) => {
                let name = stack.pop().unwrap_or_default();
                if name == "cell" && at(&stack, CELLS_PATH) {
                    cells.extend(cell.take());
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => bail!("failed to parse host capabilities: {e}"),
            _ => {}
        }
    }

    Ok(cells)
}

fn open_element(
    stack: &[String],
    name: &str,
    e: &BytesStart,
    cell: &mut Option<Cell>,
    memory_unit: &mut String,
    page_size_kib: &mut Option<u64>,
) -> Result<()> {
    if name == "cell" && at(stack, CELLS_PATH) {
        *cell = Some(Cell {
            id: parse_attribute(e, "id")?,
            ..Default::default()
        });
        return Ok(());
    }
    let Some(current) = cell.as_mut() else {
        return Ok(());
    };
    if at_cell(stack) {
        match name {
            "memory" => *memory_unit = attribute(e, "unit").unwrap_or_else(|| "KiB".to_string()),
            "pages" => {
                let size: u64 = parse_attribute(e, "size")?;
                let unit = attribute(e, "unit").unwrap_or_else(|| "KiB".to_string());
                *page_size_kib = Some(to_kib(size, &unit));
            }
            _ => {}
        }
    } else if at_cell_child(stack, "distances") && name == "sibling" {
        current
            .distances
            .insert(parse_attribute(e, "id")?, parse_attribute(e, "value")?);
    } else if at_cell_child(stack, "cpus") && name == "cpu" {
        let id = parse_attribute(e, "id")?;
        current.cpus.push(HostCpu {
            id,
            socket_id: parse_attribute(e, "socket_id")?,
            core_id: parse_attribute(e, "core_id")?,
            siblings: attribute(e, "siblings").unwrap_or_else(|| id.to_string()),
        });
    }
    Ok(())
}

fn element_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.name().as_ref()).to_string()
}

fn at(stack: &[String], path: &[&str]) -> bool {
    stack.len() == path.len() && stack.iter().zip(path).all(|(a, b)| a == b)
}

fn at_cell(stack: &[String]) -> bool {
    stack.len() == CELLS_PATH.len() + 1
        && at(&stack[..CELLS_PATH.len()], CELLS_PATH)
        && stack[CELLS_PATH.len()] == "cell"
}

fn at_cell_child(stack: &[String], child: &str) -> bool {
    match stack.split_last() {
        Some((last, parent)) => last == child && at_cell(parent),
        None => false,
    }
}

fn attribute(e: &BytesStart, name: &str) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == name.as_bytes())
        .map(|attr| String::from_utf8_lossy(&attr.value).to_string())
}

fn parse_attribute<T>(e: &BytesStart, name: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = attribute(e, name)
        .with_context(|| format!("<{}> has no {name} attribute", element_name(e)))?;
    raw.parse()
        .with_context(|| format!("invalid {name} {raw:?} on <{}>", element_name(e)))
}

/// Converts an amount in a libvirt memory unit to KiB.
fn to_kib(value: u64, unit: &str) -> u64 {
    match unit {
        "b" | "bytes" => value / 1024,
        "KB" => value * 1000 / 1024,
        "k" | "KiB" => value,
        "MB" => value * 1_000_000 / 1024,
        "M" | "MiB" => value * 1024,
        "GB" => value * 1_000_000_000 / 1024,
        "G" | "GiB" => value * 1024 * 1024,
        "T" | "TiB" => value * 1024 * 1024 * 1024,
        _ => {
            warn!("unknown memory unit {unit}, assuming KiB");
            value
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm_xml::CAPABILITIES_XML;

    #[test]
    fn parse_host_topology() {
        let topology = parse_capabilities(CAPABILITIES_XML).unwrap();
        assert_eq!(topology.len(), 2);
        assert_eq!(topology[0].id, 0);
        assert_eq!(topology[0].cpus.len(), 4);
        assert_eq!(
            topology[0].cpus[0],
            HostCpu {
                id: 0,
                socket_id: 0,
                core_id: 0,
                siblings: "0,4".to_string(),
            }
        );
        assert_eq!(topology[0].memory_kib, 32646592);
        assert_eq!(topology[1].memory_kib, 32209 * 1024);
        assert_eq!(
            topology[0].distances.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>(),
            vec![(0, 10), (1, 21)]
        );
        assert_eq!(
            topology[0].pages,
            vec![
                PageInfo { size_kib: 4, count: 8161648 },
                PageInfo { size_kib: 2048, count: 0 },
                PageInfo { size_kib: 1048576, count: 0 },
            ]
        );
        assert_eq!(topology[1].pages[1], PageInfo { size_kib: 2048, count: 16 });
        assert_eq!(topology[1].cpus[3].siblings, "3,7");
    }

    #[test]
    fn host_cpu_pages_are_not_cells() {
        // <host><cpu><pages/> sits outside the cell list
        let topology = parse_capabilities(CAPABILITIES_XML).unwrap();
        assert!(topology.iter().all(|cell| cell.pages.len() <= 3));
    }

    #[test]
    fn empty_cell_element() {
        let caps = "<capabilities><host><topology><cells num='1'><cell id='3'/></cells></topology></host></capabilities>";
        let topology = parse_capabilities(caps).unwrap();
        assert_eq!(
            topology,
            vec![Cell {
                id: 3,
                ..Default::default()
            }]
        );
    }

    #[test]
    fn invalid_attributes_are_errors() {
        let caps = "<capabilities><host><topology><cells><cell id='x'></cell></cells></topology></host></capabilities>";
        assert!(parse_capabilities(caps).is_err());
        let caps = "<capabilities><host><topology><cells><cell id='0'><cpus><cpu id='0' core_id='0'/></cpus></cell></cells></topology></host></capabilities>";
        assert!(parse_capabilities(caps).is_err());
    }

    #[test]
    fn memory_units() {
        assert_eq!(to_kib(4, "KiB"), 4);
        assert_eq!(to_kib(2, "MiB"), 2048);
        assert_eq!(to_kib(1, "G"), 1048576);
        assert_eq!(to_kib(2048, "bytes"), 2);
    }
}
