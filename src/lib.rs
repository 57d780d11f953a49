//! Differential ELF object builder for userspace live patching.
//!
//! Given two relocatable objects compiled from the same source unit (the
//! original and the patched build) plus the running binary the patch will be
//! injected into, the pipeline pairs the two object graphs, classifies every
//! section and symbol, selects the minimal sub-graph the patch needs, and
//! emits a fresh relocatable object carrying the changed code together with
//! the `.upatch.*` metadata the runtime loader consumes.

pub mod arch;
pub mod bundling;
pub mod comparison;
pub mod correlation;
pub mod creation;
pub mod debug_info;
pub mod inclusion;
pub mod logger;
pub mod model;
pub mod reading;
pub mod rewriting;
pub mod running;
pub mod writing;

#[cfg(test)]
mod testgraph;

use anyhow::{Context, Result};
use log::{debug, info};
use std::fs;
use std::path::Path;

/// Result of a diff run over in-memory objects.
#[derive(Debug)]
pub enum DiffResult {
    /// The two objects are behaviorally identical; nothing to emit.
    NoChanges,
    /// A patch object was assembled.
    Patch {
        bytes: Vec<u8>,
        changed_functions: usize,
        new_globals: usize,
    },
}

/// Outcome of a full file-to-file build.
pub enum BuildOutcome {
    NoChanges,
    Written {
        changed_functions: usize,
        new_globals: usize,
    },
}

/// Run the whole differencing pipeline over raw file contents. This is the
/// core the CLI wraps; it performs no file I/O of its own.
pub fn diff_objects(
    source_bytes: &[u8],
    patched_bytes: &[u8],
    running_bytes: &[u8],
) -> Result<DiffResult> {
    let mut source = reading::load_object(source_bytes, "source")?;
    let mut patched = reading::load_object(patched_bytes, "patched")?;
    let relf = running::RunningElf::load(running_bytes, "running")?;

    reading::compare_elf_headers(&source, &patched)?;
    reading::check_program_headers(&source, "source")?;
    reading::check_program_headers(&patched, "patched")?;

    bundling::bundle_symbols(&mut source)?;
    bundling::bundle_symbols(&mut patched)?;
    bundling::detect_child_functions(&mut source);
    bundling::detect_child_functions(&mut patched);

    correlation::find_file_symbol(&mut source, &relf)?;

    reading::mark_grouped_sections(&mut patched)?;

    rewriting::replace_section_syms(&mut source)?;
    rewriting::replace_section_syms(&mut patched)?;

    correlation::correlate_elfs(&mut source, &mut patched);
    correlation::correlate_static_local_variables(&mut source, &mut patched);

    comparison::mark_ignored_sections(&mut patched);
    comparison::compare_correlated_elements(&mut patched, &source)?;

    // Everything the output needs now lives in the patched graph.
    drop(source);

    inclusion::include_standard_elements(&mut patched);
    let changed_functions = inclusion::include_changed_functions(&mut patched);
    let new_globals = inclusion::include_new_globals(&mut patched);
    debug!(
        "{} changed functions, {} new globals",
        changed_functions, new_globals
    );

    debug_info::include_debug_sections(&mut patched)?;
    inclusion::print_changes(&patched);
    inclusion::verify_patchability(&patched)?;

    if changed_functions == 0 && new_globals == 0 {
        info!("no changed functions were found");
        return Ok(DiffResult::NoChanges);
    }

    let mut out = creation::migrate_included_elements(&mut patched)?;
    creation::create_strings_elements(&mut out);
    creation::create_patches_sections(&mut out, &relf)?;
    let records = creation::create_intermediate_sections(&mut out)?;
    creation::create_arch_section(&mut out, changed_functions)?;
    creation::build_strings_section_data(&mut out)?;

    creation::reorder_symbols(&mut out);
    creation::strip_unneeded_syms(&mut out);
    creation::reindex_elements(&mut out)?;
    creation::check_relocations(&out)?;
    creation::partly_resolve(&mut out, &relf, &records)?;

    let bytes = writing::write_output_elf(&mut out)?;
    Ok(DiffResult::Patch {
        bytes,
        changed_functions,
        new_globals,
    })
}

/// File-level entry point: read the three inputs, run the pipeline, and on
/// success write the output atomically with mode 0664. No output file is
/// left behind on failure or when nothing changed.
pub fn build_patch(
    source: &Path,
    patched: &Path,
    running: &Path,
    output: &Path,
) -> Result<BuildOutcome> {
    let source_bytes =
        fs::read(source).with_context(|| format!("cannot read {}", source.display()))?;
    let patched_bytes =
        fs::read(patched).with_context(|| format!("cannot read {}", patched.display()))?;
    let running_bytes =
        fs::read(running).with_context(|| format!("cannot read {}", running.display()))?;

    match diff_objects(&source_bytes, &patched_bytes, &running_bytes)? {
        DiffResult::NoChanges => Ok(BuildOutcome::NoChanges),
        DiffResult::Patch {
            bytes,
            changed_functions,
            new_globals,
        } => {
            write_atomically(output, &bytes)
                .with_context(|| format!("cannot write {}", output.display()))?;
            Ok(BuildOutcome::Written {
                changed_functions,
                new_globals,
            })
        }
    }
}

fn write_atomically(output: &Path, bytes: &[u8]) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let file_name = output
        .file_name()
        .context("output path has no file name")?
        .to_string_lossy()
        .into_owned();
    let tmp = output.with_file_name(format!("{}.tmp", file_name));

    let staged = fs::write(&tmp, bytes)
        .and_then(|_| fs::set_permissions(&tmp, fs::Permissions::from_mode(0o664)))
        .and_then(|_| fs::rename(&tmp, output));
    if let Err(err) = staged {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}
