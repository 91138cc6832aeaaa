use std::error::Error;
use std::net::IpAddr;
use std::str::FromStr;

use fib_store::{DirectLookup, RadixLookup, RouteTable};
use inetnum::addr::Prefix;
use rand::prelude::*;

fn addr(s: &str) -> IpAddr {
    IpAddr::from_str(s).unwrap()
}

fn engine(specs: &[&str]) -> DirectLookup {
    let mut t = DirectLookup::new();
    t.configure(specs).unwrap();
    t.initialize().unwrap();
    t
}

#[test]
fn test_scenario_two_routes() -> Result<(), Box<dyn Error>> {
    let t = engine(&["10.0.0.0/8 1", "10.1.0.0/16 2"]);
    assert_eq!(t.lookup(addr("10.0.0.1")), (1, addr("0.0.0.0")));
    assert_eq!(t.lookup(addr("10.1.2.3")), (2, addr("0.0.0.0")));
    assert_eq!(t.lookup(addr("11.0.0.1")), (-1, addr("0.0.0.0")));
    Ok(())
}

#[test]
fn test_default_route_marks_no_chunks() -> Result<(), Box<dyn Error>> {
    let mut t = engine(&["10.0.0.0/8 1", "10.1.0.0/16 2"]);
    t.add_route(&fib_store::Route::new(
        Prefix::from_str("0.0.0.0/0")?,
        addr("1.2.3.4"),
        3,
    ))?;
    assert_eq!(t.updates_pending(), 0);
    assert_eq!(t.lookup(addr("11.0.0.1")), (3, addr("1.2.3.4")));
    Ok(())
}

#[test]
fn test_agrees_with_radix_on_random_tables() -> Result<(), Box<dyn Error>> {
    let mut rng = StdRng::seed_from_u64(0xd1c7);
    let mut specs: Vec<String> = Vec::new();
    for _ in 0..300 {
        let plen = rng.gen_range(8..=32u8);
        let key = rng.gen::<u32>() & (u32::MAX << (32 - plen as u32));
        let port = rng.gen_range(0..16);
        specs.push(format!(
            "{}/{} {}",
            std::net::Ipv4Addr::from(key),
            plen,
            port
        ));
    }
    specs.push("0.0.0.0/0 99".to_string());

    let mut reference = RadixLookup::new();
    let mut t = DirectLookup::new();
    for s in &specs {
        // Duplicates may occur; both engines must agree on rejecting.
        let a = reference.control(&format!("set {}", s));
        let b = t.control(&format!("set {}", s));
        assert_eq!(a.is_ok(), b.is_ok());
    }
    t.initialize()?;

    for _ in 0..20_000 {
        let probe: u32 = rng.gen();
        let a = std::net::Ipv4Addr::from(probe);
        assert_eq!(
            t.lookup(IpAddr::V4(a)),
            reference.lookup(IpAddr::V4(a)),
            "{}",
            a
        );
    }
    Ok(())
}

#[test]
fn test_churn_keeps_tables_consistent() -> Result<(), Box<dyn Error>> {
    let mut rng = StdRng::seed_from_u64(42);
    let mut reference = RadixLookup::new();
    let mut t = engine(&[]);
    let mut live: Vec<String> = Vec::new();

    for round in 0..40 {
        // Insert a burst of /22..=/26 routes in a narrow window so
        // chunks get rewritten repeatedly.
        for _ in 0..20 {
            let plen = rng.gen_range(22..=26u8);
            let key = (0x0a00_0000u32
                | (rng.gen::<u32>() & 0x003f_ffff))
                & (u32::MAX << (32 - plen as u32));
            let spec = format!(
                "{}/{} {}",
                std::net::Ipv4Addr::from(key),
                plen,
                rng.gen_range(0..8)
            );
            let a = reference.control(&format!("set {}", spec));
            let b = t.control(&format!("set {}", spec));
            assert_eq!(a.is_ok(), b.is_ok());
            if a.is_ok() {
                live.push(spec.split(' ').next().unwrap().to_string());
            }
        }
        // Remove a few.
        live.shuffle(&mut rng);
        for _ in 0..5.min(live.len()) {
            let pfx = live.pop().unwrap();
            let p = Prefix::from_str(&pfx)?;
            let _ = reference.remove_route(&p);
            let _ = t.remove_route(&p);
        }
        t.apply_pending()?;

        for _ in 0..2000 {
            let probe = 0x0a00_0000u32 | (rng.gen::<u32>() & 0x003f_ffff);
            let a = std::net::Ipv4Addr::from(probe);
            assert_eq!(
                t.lookup(IpAddr::V4(a)),
                reference.lookup(IpAddr::V4(a)),
                "round {} probe {}",
                round,
                a
            );
        }
    }
    Ok(())
}
