use std::env;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::process;
use std::time::Duration;

use anyhow::{Context, Result};

use dns_client::{QueryError, QuerySession, DEFAULT_TIMEOUT, DNS_PORT};
use dns_msg::DnsResponse;

mod dns_client;
mod dns_msg;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <resolver_ip> <hostname> [timeout_secs]", args[0]);
        process::exit(2);
    }

    let resolver: Ipv4Addr = args[1]
        .parse()
        .context("resolver must be an IPv4 address")?;
    let timeout = match args.get(3) {
        Some(secs) => Duration::from_secs(
            secs.parse()
                .context("timeout must be a whole number of seconds")?,
        ),
        None => DEFAULT_TIMEOUT,
    };

    let session = QuerySession::new(
        SocketAddr::V4(SocketAddrV4::new(resolver, DNS_PORT)),
        timeout,
    )?;
    match session.run(&args[2]) {
        Ok(response) => print_response(&response),
        Err(QueryError::TimedOut) => {
            eprintln!("Request timeout");
            process::exit(1);
        }
        Err(e) => return Err(e.into()),
    }

    Ok(())
}

fn print_response(response: &DnsResponse) {
    let header = &response.header;
    let flags = &header.flags;
    println!("Header:");
    println!("\tid: {}", header.id);
    println!("\tflags:");
    println!("\t\tqr: {}", flags.qr);
    println!("\t\topcode: {}", flags.opcode);
    println!("\t\taa: {}", flags.aa);
    println!("\t\ttc: {}", flags.tc);
    println!("\t\trd: {}", flags.rd);
    println!("\t\tra: {}", flags.ra);
    println!("\t\trcode: {}", flags.rcode);
    println!("\tqd_count: {}", header.qd_count);
    println!("\tan_count: {}", header.an_count);
    println!("\tns_count: {}", header.ns_count);
    println!("\tar_count: {}", header.ar_count);

    println!("Question:");
    println!("\tname: {}", response.question.name);
    println!("\tqtype: {}", response.question.qtype);
    println!("\tqclass: {}", response.question.qclass);

    for answer in &response.answers {
        println!("Answer:");
        println!(
            "\tname offset: {}{}",
            answer.name_offset(),
            if answer.is_pointer() { " (pointer)" } else { "" }
        );
        println!("\ttype: {}", answer.rtype);
        println!("\tclass: {}", answer.rclass);
        println!("\tttl (seconds): {}", answer.ttl);
        println!("\trd_length: {}", answer.rd_length);
        println!("\tip: {}", answer.addr);
    }
}
