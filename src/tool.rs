// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! CLI tool for inspecting reftable files and stacks

use clap::{Parser, Subcommand};
use reftable::{LogValue, Reader, RefValue, Stack, WriteOptions};
use std::path::PathBuf;

macro_rules! die {
    ($fmt:literal, $($arg:tt)*) => {{
        eprintln!($fmt, $($arg)*);
        std::process::exit(1);
    }};
}

/// CLI tool for inspecting reftable files and stacks
#[derive(Parser, Debug)]
#[command(name = "reftable")]
#[command(about = "CLI tool for inspecting reftable files and stacks")]
struct ToolArgs {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print all ref and log records of a single table file
    Dump {
        /// Path to a *.ref table file
        table: PathBuf,
    },

    /// Show the tables of a stack
    List {
        /// Path to the stack directory
        stack: PathBuf,
    },

    /// Read one ref through a stack's merged view
    Read {
        /// Path to the stack directory
        stack: PathBuf,

        /// Name of the ref
        refname: String,
    },
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn print_ref_value(value: &RefValue) -> String {
    match value {
        RefValue::Deletion => "(deleted)".into(),
        RefValue::Val1(oid) => hex(oid),
        RefValue::Val2 {
            value,
            target_value,
        } => format!("{} (peeled {})", hex(value), hex(target_value)),
        RefValue::Symref(target) => format!("=> {target}"),
    }
}

fn dump_table(path: &PathBuf) -> reftable::Result<()> {
    let reader = Reader::open_path(path)?;

    println!(
        "{}: {:?}, update indices [{}, {}]",
        reader.name(),
        reader.hash_id(),
        reader.min_update_index(),
        reader.max_update_index(),
    );

    for rec in reader.ref_iter()? {
        let rec = rec?;
        println!("ref {} @ {}: {}", rec.refname, rec.update_index, print_ref_value(&rec.value));
    }

    for rec in reader.seek_log("")? {
        let rec = rec?;
        match &rec.value {
            LogValue::Deletion => {
                println!("log {} @ {}: (deleted)", rec.refname, rec.update_index);
            }
            LogValue::Update(update) => {
                println!(
                    "log {} @ {}: {} -> {} by {} <{}> at {} {:+05}: {}",
                    rec.refname,
                    rec.update_index,
                    hex(&update.old_hash),
                    hex(&update.new_hash),
                    update.name,
                    update.email,
                    update.time,
                    update.tz_offset,
                    update.message.trim_end(),
                );
            }
        }
    }

    Ok(())
}

fn list_stack(path: &PathBuf) -> reftable::Result<()> {
    let stack = Stack::new(path, WriteOptions::default())?;

    println!(
        "{} table(s), next update index {}",
        stack.merged().tables_len(),
        stack.next_update_index(),
    );

    let mut iter = stack.merged().ref_iter()?;
    let mut refs = 0usize;
    for rec in &mut iter {
        rec?;
        refs += 1;
    }
    println!("{refs} ref record(s) in the merged view");

    Ok(())
}

fn read_ref(path: &PathBuf, refname: &str) -> reftable::Result<()> {
    let stack = Stack::new(path, WriteOptions::default())?;

    match stack.read_ref(refname)? {
        Some(rec) => println!(
            "{} @ {}: {}",
            rec.refname,
            rec.update_index,
            print_ref_value(&rec.value),
        ),
        None => println!("{refname}: not found"),
    }

    Ok(())
}

fn main() {
    env_logger::init();

    let args = ToolArgs::parse();

    let result = match &args.command {
        Command::Dump { table } => dump_table(table),
        Command::List { stack } => list_stack(stack),
        Command::Read { stack, refname } => read_ref(stack, refname),
    };

    if let Err(e) = result {
        die!("error: {e}",);
    }
}
