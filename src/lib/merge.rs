//! Applies a [`TuningConfig`] on top of an existing domain definition.
//!
//! Every write goes through [`resolve`], so missing elements are created and existing
//! ones are updated in place. The merge never deletes anything except the two things
//! the configuration explicitly suppresses: the `match` attribute of a host cpu mode
//! and `memoryBacking/nosharepages`.

use crate::path::{find_mut, resolve, Segment};
use crate::structs::{
    ClockConfig, CpuConfig, HypervisorFeatures, MemConfig, NumaTuneConfig, TuningConfig, Value,
};
use crate::xml_tree::{Document, Element, XmlError};

/// Parses `input`, merges `config` into it and serializes the result as UTF-8.
pub fn merge_config(input: &str, config: &TuningConfig) -> Result<Vec<u8>, XmlError> {
    let mut document = Document::parse(input)?;
    apply_config(document.root_mut(), config);
    document.to_bytes()
}

/// Merges `config` into the tree rooted at the `<domain>` element.
pub fn apply_config(doc: &mut Element, config: &TuningConfig) {
    if let Some(cpu) = &config.cpu {
        merge_cpu_config(doc, cpu);
    }
    if let Some(numatune) = &config.numatune {
        merge_numatune_config(doc, numatune);
    }
    if let Some(mem) = &config.mem {
        merge_memory_config(doc, mem);
    }
    if let Some(features) = &config.hypervisor_features {
        merge_hypervisor_features(doc, features);
    }
    if let Some(clock) = &config.clock {
        merge_clock_config(doc, clock);
    }
}

fn set_attribute<V: Into<Value>>(doc: &mut Element, path: &[Segment], attr: &str, value: Option<V>) {
    if let Some(value) = value {
        resolve(doc, path).set_attr(attr, value.into().to_string());
    }
}

fn set_text<V: Into<Value>>(doc: &mut Element, path: &[Segment], value: Option<V>) {
    if let Some(value) = value {
        resolve(doc, path).set_text(&value.into().to_string());
    }
}

/// Splits `"<value> <unit>"`; anything else yields `None`.
fn split_mem(value: &str) -> Option<(&str, &str)> {
    let mut parts = value.split(' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(amount), Some(unit), None) => Some((amount, unit)),
        _ => None,
    }
}

/// Memory amount as element text, unit as attribute.
fn set_mem(doc: &mut Element, path: &[Segment], value: Option<&str>) {
    let Some(value) = value else { return };
    match split_mem(value) {
        Some((amount, unit)) => {
            set_text(doc, path, Some(amount));
            set_attribute(doc, path, "unit", Some(unit));
        }
        None => debug!("ignoring memory value without unit: {value:?}"),
    }
}

/// Memory amount as `attr`, unit as attribute.
fn set_mem_attr(doc: &mut Element, path: &[Segment], attr: &str, value: Option<&str>) {
    let Some(value) = value else { return };
    match split_mem(value) {
        Some((amount, unit)) => {
            set_attribute(doc, path, attr, Some(amount));
            set_attribute(doc, path, "unit", Some(unit));
        }
        None => debug!("ignoring memory value without unit: {value:?}"),
    }
}

fn merge_cpu_config(doc: &mut Element, config: &CpuConfig) {
    debug!("merging cpu configuration");
    let vcpu = [Segment::child("vcpu")];
    set_attribute(doc, &vcpu, "placement", config.placement.as_deref());
    set_text(doc, &vcpu, config.maximum);

    if let Some(topology) = &config.topology {
        let path = [Segment::child("cpu"), Segment::child("topology")];
        set_attribute(doc, &path, "sockets", topology.sockets);
        set_attribute(doc, &path, "cores", topology.cores);
        set_attribute(doc, &path, "threads", topology.threads);
    }

    let cpu = [Segment::child("cpu")];
    set_attribute(doc, &cpu, "mode", config.mode);
    if config.mode.is_some_and(|mode| mode.excludes_match()) {
        if let Some(cpu) = find_mut(doc, &cpu) {
            if cpu.remove_attr("match").is_some() {
                debug!("dropped cpu match attribute");
            }
        }
    }
    set_attribute(doc, &cpu, "check", config.check.as_deref());

    for (feature, policy) in &config.features {
        let path = [
            Segment::child("cpu"),
            Segment::with_attr("feature", "name", feature),
        ];
        set_attribute(doc, &path, "policy", Some(policy));
    }

    if let Some(tuning) = &config.tuning {
        for (vcpu_id, cpuset) in &tuning.vcpupin {
            let path = [
                Segment::child("cputune"),
                Segment::with_attr("vcpupin", "vcpu", vcpu_id),
            ];
            set_attribute(doc, &path, "cpuset", Some(cpuset));
        }
    }

    for (cell_id, numa) in &config.numa {
        let cell_path = [
            Segment::child("cpu"),
            Segment::child("numa"),
            Segment::with_attr("cell", "id", cell_id),
        ];
        set_attribute(doc, &cell_path, "cpus", numa.cpus.as_deref());

        match numa.memory.as_deref() {
            Some(memory) if memory.ends_with(" MiB") => {
                let amount = memory.split(' ').next();
                set_attribute(doc, &cell_path, "memory", amount);
                set_attribute(doc, &cell_path, "unit", Some("MiB"));
            }
            Some(memory) => debug!("cell {cell_id}: skipping memory {memory:?}, only MiB is supported"),
            None => {}
        }

        if numa.distances.is_empty() {
            continue;
        }
        let cell = resolve(doc, &cell_path);
        for (sibling_id, distance) in &numa.distances {
            let path = [
                Segment::child("distances"),
                Segment::with_attr("sibling", "id", sibling_id),
            ];
            set_attribute(cell, &path, "value", Some(*distance));
        }
    }
}

fn merge_numatune_config(doc: &mut Element, config: &NumaTuneConfig) {
    debug!("merging numatune configuration");
    if let Some(memory) = &config.memory {
        let path = [Segment::child("numatune"), Segment::child("memory")];
        set_attribute(doc, &path, "mode", memory.mode.as_deref());
        set_attribute(doc, &path, "nodeset", memory.nodeset.as_deref());
    }

    for (node_id, memnode) in &config.memnodes {
        let path = [
            Segment::child("numatune"),
            Segment::with_attr("memnode", "cellid", node_id),
        ];
        for (attribute, value) in memnode {
            set_attribute(doc, &path, attribute, Some(value.clone()));
        }
    }
}

fn merge_memory_config(doc: &mut Element, config: &MemConfig) {
    debug!("merging memory configuration");
    set_mem(doc, &[Segment::child("memory")], config.boot.as_deref());
    set_mem(doc, &[Segment::child("currentMemory")], config.current.as_deref());

    match config.nosharepages {
        Some(true) => {
            resolve(
                doc,
                &[Segment::child("memoryBacking"), Segment::child("nosharepages")],
            );
        }
        Some(false) => {
            if let Some(backing) = find_mut(doc, &[Segment::child("memoryBacking")]) {
                if backing.remove_child("nosharepages").is_some() {
                    debug!("removed memoryBacking/nosharepages");
                }
            }
        }
        None => {}
    }

    for (i, page) in config.hugepages.iter().enumerate() {
        let path = [
            Segment::child("memoryBacking"),
            Segment::child("hugepages"),
            Segment::nth("page", i + 1),
        ];
        set_mem_attr(doc, &path, "size", page.size.as_deref());
    }
}

fn merge_hypervisor_features(doc: &mut Element, config: &HypervisorFeatures) {
    // enable only, Some(false) leaves the hint alone
    if config.kvm_hint_dedicated == Some(true) {
        let path = [
            Segment::child("features"),
            Segment::child("kvm"),
            Segment::child("hint-dedicated"),
        ];
        set_attribute(doc, &path, "state", Some("on"));
    }
}

fn merge_clock_config(doc: &mut Element, config: &ClockConfig) {
    debug!("merging clock configuration");
    for (timer_name, timer) in &config.timers {
        let path = [
            Segment::child("clock"),
            Segment::with_attr("timer", "name", timer_name),
        ];
        for (attribute, value) in timer {
            set_attribute(doc, &path, attribute, Some(value.clone()));
        }
    }
}
