use anyhow::{bail, Result};
use std::collections::{BTreeMap, BTreeSet};

use crate::structs::{
    attributes, Cell, ClockConfig, CpuConfig, CpuMode, CpuTopology, CpuTuning, HostCpu, HugePage,
    HypervisorFeatures, MemConfig, NumaCell, NumaMemory, NumaTuneConfig, TuningConfig,
};

const KIB_PER_GIB: f64 = 1024.0 * 1024.0;
/// Share of the host memory handed to the guest as 1GiB pages.
const HOST_MEMORY_SHARE: f64 = 0.91;

pub struct Template {
    pub name: &'static str,
    pub description: &'static str,
    pub function: fn(&[Cell]) -> Result<TuningConfig>,
}

pub const TEMPLATES: &[Template] = &[Template {
    name: "single",
    description: "Single virtual machine using almost all the host resources",
    function: single,
}];

pub fn find_template(name: &str) -> Option<&'static Template> {
    TEMPLATES.iter().find(|template| template.name == name)
}

pub fn list_templates() -> String {
    let mut buf = String::from("templates:\n");
    for template in TEMPLATES {
        buf.push_str(&format!(" - {}: {}\n", template.name, template.description));
    }
    buf
}

fn core_key(cpu: &HostCpu) -> (u32, u32) {
    (cpu.socket_id, cpu.core_id)
}

/// One guest spanning every host cell, backed by 1GiB pages.
pub fn single(cells: &[Cell]) -> Result<TuningConfig> {
    if cells.is_empty() {
        bail!("the host topology has no NUMA cell");
    }
    let host_memory: u64 = cells.iter().map(|cell| cell.memory_kib).sum();
    if host_memory == 0 {
        bail!("the host topology reports no memory");
    }

    // QEMU only places two vcpus on the same core when their ids are consecutive,
    // so host cpus are renumbered in (socket, core) order.
    let mut order: Vec<(usize, usize)> = cells
        .iter()
        .enumerate()
        .flat_map(|(c, cell)| (0..cell.cpus.len()).map(move |p| (c, p)))
        .collect();
    order.sort_by_key(|&(c, p)| core_key(&cells[c].cpus[p]));

    let mut guest_ids: Vec<Vec<u32>> = cells.iter().map(|cell| vec![0; cell.cpus.len()]).collect();
    let mut vcpupin = BTreeMap::new();
    for (vcpu, &(c, p)) in order.iter().enumerate() {
        let vcpu = vcpu as u32;
        guest_ids[c][p] = vcpu;
        vcpupin.insert(vcpu, cells[c].cpus[p].siblings.clone());
    }

    let cpus: Vec<&HostCpu> = cells.iter().flat_map(|cell| &cell.cpus).collect();
    let sockets = cpus.iter().map(|cpu| cpu.socket_id).collect::<BTreeSet<_>>().len() as u32;
    let cores = cpus.iter().map(|cpu| cpu.core_id).collect::<BTreeSet<_>>().len() as u32;
    let mut threads_per_core: BTreeMap<(u32, u32), u32> = BTreeMap::new();
    for cpu in &cpus {
        *threads_per_core.entry(core_key(cpu)).or_default() += 1;
    }
    let threads = threads_per_core.values().copied().min().unwrap_or(1);

    // Same amount of 1GiB pages on each cell, covering at most 91% of the host memory.
    let cell_count = cells.len() as f64;
    let cell_pages_max = cells
        .iter()
        .map(|cell| cell.memory_kib / (1024 * 1024))
        .min()
        .unwrap_or(0);
    let mut pages_per_cell =
        (host_memory as f64 * HOST_MEMORY_SHARE / KIB_PER_GIB / cell_count) as u64;
    if cell_pages_max as f64 * cell_count * KIB_PER_GIB / host_memory as f64 <= HOST_MEMORY_SHARE {
        pages_per_cell = cell_pages_max;
    }
    let vm_memory = pages_per_cell * cells.len() as u64;
    debug!("{pages_per_cell} 1GiB pages per cell, {vm_memory}GiB for the guest");

    let numa = cells
        .iter()
        .zip(&guest_ids)
        .map(|(cell, ids)| {
            let mut ids = ids.clone();
            ids.sort_unstable();
            let cpus: Vec<String> = ids.iter().map(u32::to_string).collect();
            (
                cell.id,
                NumaCell {
                    cpus: Some(cpus.join(",")),
                    memory: Some(format!("{pages_per_cell} GiB")),
                    distances: cell.distances.clone(),
                },
            )
        })
        .collect();
    let nodeset: Vec<String> = cells.iter().map(|cell| cell.id.to_string()).collect();
    let memnodes = cells
        .iter()
        .map(|cell| (cell.id, attributes! { "mode" => "strict", "nodeset" => cell.id }))
        .collect();

    Ok(TuningConfig {
        cpu: Some(CpuConfig {
            placement: Some("static".to_string()),
            maximum: Some(sockets * cores * threads),
            topology: Some(CpuTopology {
                sockets: Some(sockets),
                cores: Some(cores),
                threads: Some(threads),
            }),
            mode: Some(CpuMode::HostPassthrough),
            check: Some("none".to_string()),
            features: ["rdtscp", "invtsc", "x2apic"]
                .into_iter()
                .map(|feature| (feature.to_string(), "require".to_string()))
                .collect(),
            tuning: Some(CpuTuning { vcpupin }),
            numa,
        }),
        numatune: Some(NumaTuneConfig {
            memory: Some(NumaMemory {
                mode: Some("strict".to_string()),
                nodeset: Some(nodeset.join(",")),
            }),
            memnodes,
        }),
        mem: Some(MemConfig {
            boot: Some(format!("{vm_memory} GiB")),
            current: Some(format!("{vm_memory} GiB")),
            nosharepages: Some(true),
            hugepages: vec![HugePage {
                size: Some("1 G".to_string()),
            }],
        }),
        hypervisor_features: Some(HypervisorFeatures {
            kvm_hint_dedicated: Some(true),
        }),
        clock: Some(ClockConfig {
            timers: vec![
                ("rtc".to_string(), attributes! { "tickpolicy" => "catchup" }),
                ("pit".to_string(), attributes! { "tickpolicy" => "catchup" }),
                ("hpet".to_string(), attributes! { "present" => false }),
            ],
        }),
    })
}
