//! Address-to-symbol resolution for remote processes.
//!
//! Builds a sorted symbol map from `/proc/<pid>/maps` plus the ELF symbol
//! tables of every executable, file-backed mapping. Region ends carry empty
//! sentinel entries so a floor lookup can never bleed into the previous
//! region's last symbol.

use std::collections::BTreeMap;
use std::path::Path;

use goblin::Object;
use goblin::elf::header::ET_DYN;
use log::warn;
use memmap2::Mmap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SymbolsError {
    #[error("reading maps: {0}")]
    Maps(std::io::Error),

    #[error("ELF parsing error for {path}: {message}")]
    Elf { path: String, message: String },
}

/// One line of `/proc/<pid>/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapsEntry {
    pub start: u64,
    pub end: u64,
    pub is_executable: bool,
    pub pgoff: u64,
    pub inode: u64,
    pub path: String,
}

/// Sorted address -> symbol mapping. Empty strings are region-end sentinels.
pub type SymbolMap = BTreeMap<u64, String>;

/// Parses maps content, ignoring lines that don't look like map entries.
pub fn parse_proc_maps(content: &str) -> Vec<MapsEntry> {
    content.lines().filter_map(parse_maps_line).collect()
}

fn parse_maps_line(line: &str) -> Option<MapsEntry> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?;
    let pgoff = u64::from_str_radix(fields.next()?, 16).ok()?;
    let _dev = fields.next()?;
    let inode = fields.next()?.parse::<u64>().ok()?;
    let path = fields.collect::<Vec<_>>().join(" ");

    let (start, end) = range.split_once('-')?;
    Some(MapsEntry {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        is_executable: perms.as_bytes().get(2) == Some(&b'x'),
        pgoff,
        inode,
        path,
    })
}

/// ARM mapping symbols ($x, $d, ...) describe instruction-set state, not
/// functions; they would shadow real symbols.
fn is_arm_mapping_symbol(name: &str) -> bool {
    matches!(
        name.as_bytes().first(),
        Some(b'$')
    ) && matches!(name.as_bytes().get(1), Some(b'x' | b'd' | b't' | b'a' | b'v'))
}

/// Loads the symbol map for a live process.
pub fn load_symbols_map(pid: libc::pid_t) -> Result<SymbolMap, SymbolsError> {
    let content = crate::util::read_proc_maps(pid).map_err(SymbolsError::Maps)?;
    Ok(symbols_from_maps(&parse_proc_maps(&content)))
}

/// Builds the map from already-parsed maps entries.
pub fn symbols_from_maps(entries: &[MapsEntry]) -> SymbolMap {
    let mut map = SymbolMap::new();
    for entry in entries {
        if !entry.is_executable
            || entry.inode == 0
            || entry.path.is_empty()
            || entry.path.ends_with(" (deleted)")
        {
            continue;
        }

        // Region bookends. Entries are sorted by address, so a symbol at
        // exactly entry.end is overwritten by the next region's start label.
        let mut label = format!("map:{}", entry.path);
        if entry.pgoff != 0 {
            label.push_str(&format!("+{:#x}", entry.pgoff));
        }
        map.insert(entry.start, label);
        map.insert(entry.end, String::new());

        if let Err(err) = add_elf_symbols(&mut map, entry) {
            warn!("could not load symbols for {}: {err}", entry.path);
        }
    }
    map
}

fn add_elf_symbols(map: &mut SymbolMap, entry: &MapsEntry) -> Result<(), SymbolsError> {
    let elf_error = |message: String| SymbolsError::Elf {
        path: entry.path.clone(),
        message,
    };

    let file = std::fs::File::open(Path::new(&entry.path))
        .map_err(|e| elf_error(format!("open: {e}")))?;
    // SAFETY: the mapping is read-only and lives only for this parse.
    let mmap = unsafe { Mmap::map(&file) }.map_err(|e| elf_error(format!("mmap: {e}")))?;

    let object = Object::parse(&mmap).map_err(|e| elf_error(e.to_string()))?;
    let Object::Elf(elf) = object else {
        return Err(elf_error("not an ELF binary".to_string()));
    };

    let position_independent = elf.header.e_type == ET_DYN;
    let region_len = entry.end - entry.start;

    let tables = [(&elf.syms, &elf.strtab), (&elf.dynsyms, &elf.dynstrtab)];
    for (syms, strtab) in tables {
        for sym in syms.iter() {
            let Some(name) = strtab.get_at(sym.st_name) else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            if cfg!(any(target_arch = "aarch64", target_arch = "arm"))
                && is_arm_mapping_symbol(name)
            {
                continue;
            }

            let address = sym.st_value;
            if position_independent {
                // Only symbols that actually live inside this mapping's file
                // window relocate into it.
                if address >= entry.pgoff && address - entry.pgoff < region_len {
                    map.insert(address + entry.start - entry.pgoff, name.to_string());
                }
            } else if address >= entry.start && address < entry.end {
                map.insert(address, name.to_string());
            }
        }
    }
    Ok(())
}

/// Floor lookup: exact hit gives the demangled symbol, an address inside a
/// function gives `symbol+0xOFFSET`, anything outside known code gives "".
pub fn symbol_at(map: &SymbolMap, addr: u64) -> String {
    match map.range(..=addr).next_back() {
        None => String::new(),
        Some((&sym_addr, name)) if sym_addr == addr => demangle(name),
        Some((_, name)) if name.is_empty() => String::new(),
        Some((&sym_addr, name)) => format!("{}+{:#x}", demangle(name), addr - sym_addr),
    }
}

/// Rust first, C++ second, raw name as-is when neither scheme matches.
pub fn demangle(name: &str) -> String {
    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        return format!("{demangled:#}");
    }
    if let Ok(symbol) = cpp_demangle::Symbol::new(name) {
        if let Ok(demangled) = symbol.demangle(&cpp_demangle::DemangleOptions::default()) {
            return demangled;
        }
    }
    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_MAPS: &str = "\
559f13419000-559f1341d000 r--p 00000000 08:01 1048602    /usr/bin/cat
559f1341d000-559f13422000 r-xp 00004000 08:01 1048602    /usr/bin/cat
7f10c0b00000-7f10c0b28000 rw-p 00000000 00:00 0
7f10c0c85000-7f10c0ca9000 r-xp 00002000 08:01 1579008    /usr/lib/libdl (deleted)
ffffffffff600000-ffffffffff601000 --xp 00000000 00:00 0  [vsyscall]";

    #[test]
    fn parses_maps_lines() {
        let entries = parse_proc_maps(SAMPLE_MAPS);
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[1].start, 0x559f_1341_d000);
        assert_eq!(entries[1].pgoff, 0x4000);
        assert!(entries[1].is_executable);
        assert!(!entries[0].is_executable);
        assert_eq!(entries[1].path, "/usr/bin/cat");
        assert_eq!(entries[2].inode, 0);
    }

    #[test]
    fn skips_anonymous_deleted_and_data_regions() {
        // Nonexistent backing files: only the bookends logic runs, and the
        // filter drops every region here before that.
        let entries = vec![
            MapsEntry {
                start: 0x1000,
                end: 0x2000,
                is_executable: false,
                pgoff: 0,
                inode: 5,
                path: "/x/data".into(),
            },
            MapsEntry {
                start: 0x3000,
                end: 0x4000,
                is_executable: true,
                pgoff: 0,
                inode: 0,
                path: String::new(),
            },
            MapsEntry {
                start: 0x5000,
                end: 0x6000,
                is_executable: true,
                pgoff: 0,
                inode: 7,
                path: "/x/lib.so (deleted)".into(),
            },
        ];
        assert!(symbols_from_maps(&entries).is_empty());
    }

    fn test_map() -> SymbolMap {
        let mut map = SymbolMap::new();
        map.insert(0x1000, "map:/bin/demo".to_string());
        map.insert(0x1100, "alpha".to_string());
        map.insert(0x1200, "beta".to_string());
        map.insert(0x2000, String::new()); // region end
        map.insert(0x5000, "gamma".to_string());
        map.insert(0x6000, String::new());
        map
    }

    #[test]
    fn exact_lookup() {
        assert_eq!(symbol_at(&test_map(), 0x1100), "alpha");
    }

    #[test]
    fn floor_lookup_with_offset() {
        assert_eq!(symbol_at(&test_map(), 0x1180), "alpha+0x80");
        assert_eq!(symbol_at(&test_map(), 0x1fff), "beta+0xdff");
    }

    #[test]
    fn sentinel_stops_cross_region_bleed() {
        // Between regions: the floor entry is the "" sentinel, never beta.
        assert_eq!(symbol_at(&test_map(), 0x3000), "");
        assert_eq!(symbol_at(&test_map(), 0x5008), "gamma+0x8");
    }

    #[test]
    fn below_first_entry_is_unknown() {
        assert_eq!(symbol_at(&test_map(), 0x20), "");
    }

    #[test]
    fn demangles_rust_and_cpp() {
        assert_eq!(demangle("_ZN4core3ptr13drop_in_place17h1a9f3e6b8d7c5a2bE"), "core::ptr::drop_in_place");
        assert_eq!(demangle("_Z4cushv"), "cush()");
        assert_eq!(demangle("plain_c_symbol"), "plain_c_symbol");
    }

    #[test]
    fn arm_mapping_symbols_detected() {
        assert!(is_arm_mapping_symbol("$x"));
        assert!(is_arm_mapping_symbol("$d.42"));
        assert!(!is_arm_mapping_symbol("$not_mapping"));
        assert!(!is_arm_mapping_symbol("dollar"));
    }

    #[test]
    fn loads_symbols_for_own_process() {
        let map = load_symbols_map(std::process::id() as libc::pid_t).unwrap();
        // At minimum the executable regions of this test binary are labeled.
        assert!(map.values().any(|v| v.starts_with("map:")));
    }
}
