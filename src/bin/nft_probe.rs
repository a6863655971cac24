use std::env;

use anyhow::Result;

use nft_policy::models::ruleset::Family;

#[cfg(all(target_os = "linux", feature = "netlink"))]
fn main() -> Result<()> {
    use anyhow::Context;
    use nft_policy::models::ruleset::TableSpec;
    use nft_policy::netfilter::{Netfilter, NetlinkSession};

    println!("nftables probe");
    println!("Lists the tables and chains the kernel reports for one family");

    // Get family from command line or use a default
    let family: Family = match env::args().nth(1) {
        Some(name) => name.parse()?,
        None => Family::Ip,
    };

    let mut session = NetlinkSession::open()
        .context("Failed to reach nf_tables (CAP_NET_ADMIN required)")?;

    let tables = session.list_tables(family)?;
    if tables.is_empty() {
        println!("No {} tables", family);
    }
    for name in tables {
        println!("table {} {}", family, name);
        for chain in session.list_chains(&TableSpec::new(family, name.as_str()))? {
            println!("  chain {}", chain);
        }
    }

    Ok(())
}

#[cfg(not(all(target_os = "linux", feature = "netlink")))]
fn main() -> Result<()> {
    let family = env::args().nth(1).unwrap_or_else(|| Family::Ip.to_string());
    anyhow::bail!("cannot list {} tables: netlink is only available on Linux", family)
}
