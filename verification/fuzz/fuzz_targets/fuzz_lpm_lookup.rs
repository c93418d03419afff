//! Fuzz target for longest-prefix-match tables
//!
//! Random inserts, removals, and lookups against `LpmTable`, checked against a
//! linear scan of the inserted prefixes.

#![no_main]

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use arbitrary::Arbitrary;
use ipnet::Ipv4Net;
use kgguard_xdp::{parse_cidr, LpmTable};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
enum Op {
    Insert { addr: u32, prefix: u8, value: u32 },
    Remove { addr: u32, prefix: u8 },
    Lookup { addr: u32 },
    Parse { text: String },
}

fn net(addr: u32, prefix: u8) -> Ipv4Net {
    Ipv4Net::new(Ipv4Addr::from(addr), prefix % 33)
        .expect("prefix % 33 is a valid length")
        .trunc()
}

fuzz_target!(|ops: Vec<Op>| {
    let table: LpmTable<u32> = LpmTable::with_max_entries("fuzz", 64);
    let mut model: BTreeMap<Ipv4Net, u32> = BTreeMap::new();

    for op in ops {
        match op {
            Op::Insert { addr, prefix, value } => {
                let n = net(addr, prefix);
                match table.insert(n, value) {
                    Ok(_) => {
                        model.insert(n, value);
                    }
                    Err(_) => assert!(model.len() >= 64 && !model.contains_key(&n)),
                }
            }
            Op::Remove { addr, prefix } => {
                let n = net(addr, prefix);
                assert_eq!(table.remove(n), model.remove(&n));
            }
            Op::Lookup { addr } => {
                let ip = Ipv4Addr::from(addr);
                let expected = model
                    .iter()
                    .filter(|(n, _)| n.contains(&ip))
                    .max_by_key(|(n, _)| n.prefix_len())
                    .map(|(_, v)| *v);
                assert_eq!(table.lookup(ip), expected);
            }
            Op::Parse { text } => {
                if let Ok(n) = parse_cidr(&text) {
                    assert_eq!(n, n.trunc());
                }
            }
        }
        assert_eq!(table.len(), model.len());
    }
});
