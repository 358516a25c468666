//! CIDR range remediation: when an association or subnet range is rejected,
//! find a free block of the requested size and rewrite the command.

use crate::argops::{flag_value, set_flag_value};
use crate::glue::GlueOutcome;
use crate::learn::json_path;
use crate::Ctx;
use anyhow::Result;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// RFC1918 bands, largest first.
const RFC1918: &[(&str, &str)] = &[
    ("10.0.0.0", "8"),
    ("172.16.0.0", "12"),
    ("192.168.0.0", "16"),
];

/// The RFC1918 band enclosing `net`, defaulting to 10/8.
pub fn rfc1918_band(net: Ipv4Net) -> Ipv4Net {
    for (addr, prefix) in RFC1918 {
        let band: Ipv4Net = format!("{addr}/{prefix}").parse().expect("static cidr");
        if band.contains(&net.network()) {
            return band;
        }
    }
    "10.0.0.0/8".parse().expect("static cidr")
}

fn addr_to_u32(addr: Ipv4Addr) -> u32 {
    u32::from(addr)
}

fn overlaps(a: Ipv4Net, b: Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

/// First `/prefix` block inside `band` that overlaps none of `taken`.
/// Scans in address order, jumping past each overlapping allocation instead
/// of stepping block by block.
pub fn first_free_block(taken: &[Ipv4Net], band: Ipv4Net, prefix: u8) -> Option<Ipv4Net> {
    if prefix < band.prefix_len() {
        return None;
    }
    let block_size = 1u64 << (32 - prefix);
    let band_end = addr_to_u32(band.broadcast()) as u64;
    let mut cursor = addr_to_u32(band.network()) as u64;

    while cursor + block_size - 1 <= band_end {
        let candidate = Ipv4Net::new(Ipv4Addr::from(cursor as u32), prefix).ok()?;
        match taken.iter().find(|t| overlaps(candidate, **t)) {
            None => return Some(candidate),
            Some(hit) => {
                let hit_end = addr_to_u32(hit.broadcast()) as u64;
                // Jump past the allocation, aligned to the block size.
                cursor = (hit_end + 1).div_ceil(block_size) * block_size;
            }
        }
    }
    None
}

/// `ec2 associate-vpc-cidr-block` rejected with `InvalidSubnet.Range`:
/// describe the VPC, compute the enclosing RFC1918 band, pick a free block of
/// the requested prefix length, rewrite `--cidr-block`, retry.
pub async fn fix_vpc_association(ctx: &Ctx, args: &[String]) -> Result<GlueOutcome> {
    let Some(vpc_id) = flag_value(args, "--vpc-id") else {
        return Ok(GlueOutcome::NotApplicable);
    };
    let Some(requested) = flag_value(args, "--cidr-block").and_then(|c| c.parse::<Ipv4Net>().ok())
    else {
        return Ok(GlueOutcome::NotApplicable);
    };

    let Some(vpcs) = ctx
        .run_aws_json(&["ec2", "describe-vpcs", "--vpc-ids", vpc_id, "--output", "json"])
        .await?
    else {
        return Ok(GlueOutcome::NotApplicable);
    };

    let mut taken = existing_associations(&vpcs);
    if taken.is_empty() {
        return Ok(GlueOutcome::NotApplicable);
    }
    taken.sort_by_key(|n| u32::from(n.network()));

    let band = rfc1918_band(taken[0]);
    let Some(free) = first_free_block(&taken, band, requested.prefix_len()) else {
        return Ok(GlueOutcome::NotApplicable);
    };

    ctx.say(&format!(
        "cidr {requested} is taken on {vpc_id}; retrying with {free}"
    ));
    let mut rewritten = args.to_vec();
    set_flag_value(&mut rewritten, "--cidr-block", &free.to_string());
    Ok(GlueOutcome::Rewritten(rewritten))
}

/// All CIDR blocks currently associated with the VPC in a `describe-vpcs`
/// response (primary plus the association set).
pub fn existing_associations(vpcs: &serde_json::Value) -> Vec<Ipv4Net> {
    let mut out = Vec::new();
    let Some(vpc) = json_path(vpcs, "Vpcs[0]") else {
        return out;
    };
    if let Some(primary) = vpc.get("CidrBlock").and_then(|v| v.as_str()) {
        if let Ok(net) = primary.parse() {
            out.push(net);
        }
    }
    if let Some(set) = vpc.get("CidrBlockAssociationSet").and_then(|v| v.as_array()) {
        for assoc in set {
            if let Some(net) = assoc
                .get("CidrBlock")
                .and_then(|v| v.as_str())
                .and_then(|c| c.parse().ok())
            {
                if !out.contains(&net) {
                    out.push(net);
                }
            }
        }
    }
    out
}
