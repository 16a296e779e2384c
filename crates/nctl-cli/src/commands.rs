use std::collections::BTreeMap;
use std::io::Write;
use std::net::IpAddr;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use colored::Colorize;
use nctl_meta::{
    list_namespaces, remove_namespace, CreateRequest, MetaError, NameStore, NamespaceStores,
    RemoveReport,
};
use nctl_store::{BucketKind, DataStore};
use nctl_types::{ContainerId, Namespace};
use serde::Serialize;

use crate::cli::*;
use crate::config::{Overrides, Settings};

/// Everything a command needs: where the store lives and how to print.
struct Ctx {
    store: DataStore,
    namespace: Namespace,
    format: OutputFormat,
}

impl Ctx {
    fn stores(&self) -> NamespaceStores {
        NamespaceStores::open(&self.store, &self.namespace)
    }

    fn json(&self) -> bool {
        self.format == OutputFormat::Json
    }
}

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let flags = Overrides {
        config: cli.config.clone(),
        data_root: cli.data_root.clone(),
        address: cli.address.clone(),
        namespace: cli.namespace.clone(),
    };
    let settings = Settings::resolve(&flags, |key| std::env::var(key).ok())?;
    let store = DataStore::open(&settings.store).with_context(|| {
        format!("opening data store under {}", settings.store.data_root.display())
    })?;
    tracing::debug!(root = %store.root().display(), namespace = %settings.namespace, "resolved store");
    let ctx = Ctx {
        store,
        namespace: settings.namespace,
        format: cli.format,
    };

    match cli.command {
        Command::Name(args) => cmd_name(&ctx, args.action),
        Command::Volume(args) => cmd_volume(&ctx, args.action),
        Command::Container(args) => cmd_container(&ctx, args.action),
        Command::Namespace(args) => cmd_namespace(&ctx, args.action),
        Command::Hosts(args) => cmd_hosts(&ctx, args.action),
        Command::Debug(args) => cmd_debug(&ctx, args.action),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_id(raw: &str) -> anyhow::Result<ContainerId> {
    Ok(ContainerId::new(raw)?)
}

fn parse_pairs(raw: &[String], sep: char, what: &str) -> anyhow::Result<Vec<(String, String)>> {
    raw.iter()
        .map(|item| match item.split_once(sep) {
            Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
            _ => bail!("invalid {what} {item:?}: expected KEY{sep}VALUE"),
        })
        .collect()
}

fn parse_ip(raw: &str) -> anyhow::Result<IpAddr> {
    raw.parse()
        .with_context(|| format!("invalid IP address {raw:?}"))
}

// ---------------------------------------------------------------
// name
// ---------------------------------------------------------------

#[derive(Serialize)]
struct NameEntry<'a> {
    name: &'a str,
    id: &'a ContainerId,
}

fn cmd_name(ctx: &Ctx, action: NameAction) -> anyhow::Result<()> {
    let names = ctx.stores().names;
    match action {
        NameAction::Acquire { name, id } => {
            let id = parse_id(&id)?;
            names.acquire(&name, &id)?;
            println!("{} {} → {}", "✓".green().bold(), name.bold(), id.short().yellow());
        }
        NameAction::Release { name, id } => {
            match id {
                Some(id) => names.release_owned(&name, &parse_id(&id)?)?,
                None => names.release(&name)?,
            }
            println!("{} released {}", "✓".green().bold(), name.bold());
        }
        NameAction::Rename { old, new, id } => {
            names.rename(&old, &new, &parse_id(&id)?)?;
            println!("{} {} → {}", "✓".green().bold(), old, new.bold());
        }
        NameAction::Ls => {
            let claims = names.list()?;
            if ctx.json() {
                let entries: Vec<_> = claims
                    .iter()
                    .map(|(name, id)| NameEntry { name, id })
                    .collect();
                return print_json(&entries);
            }
            println!("{:<32} {}", "NAME".bold(), "CONTAINER ID".bold());
            for (name, id) in &claims {
                println!("{:<32} {}", name, id.short().yellow());
            }
        }
        NameAction::Inspect { name } => {
            let id = names
                .lookup(&name)?
                .ok_or(MetaError::NameNotFound { name: name.clone() })?;
            if ctx.json() {
                return print_json(&NameEntry { name: &name, id: &id });
            }
            println!("{id}");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------
// volume
// ---------------------------------------------------------------

fn cmd_volume(ctx: &Ctx, action: VolumeAction) -> anyhow::Result<()> {
    let stores = ctx.stores();
    match action {
        VolumeAction::Create { name, labels } => {
            let labels: BTreeMap<_, _> = parse_pairs(&labels, '=', "label")?.into_iter().collect();
            let volume = match name {
                Some(name) => stores.volumes.create(&name, labels)?,
                None => stores.volumes.create_anonymous(labels)?,
            };
            if ctx.json() {
                return print_json(&volume);
            }
            println!("{}", volume.name);
        }
        VolumeAction::Ls { size } => {
            let volumes = stores.volumes.list(size)?;
            if ctx.json() {
                return print_json(&volumes);
            }
            if size {
                println!("{:<66} {}", "VOLUME NAME".bold(), "SIZE".bold());
            } else {
                println!("{}", "VOLUME NAME".bold());
            }
            for volume in &volumes {
                match volume.size {
                    Some(bytes) => println!("{:<66} {}", volume.name, human_size(bytes)),
                    None => println!("{}", volume.name),
                }
            }
        }
        VolumeAction::Inspect { names, size } => {
            let volumes = names
                .iter()
                .map(|name| stores.volumes.get(name, size))
                .collect::<Result<Vec<_>, _>>()?;
            print_json(&volumes)?;
        }
        VolumeAction::Rm { names } => {
            let report = stores.remove_volumes(&names)?;
            report_removal(ctx, &report)?;
        }
    }
    Ok(())
}

fn report_removal(ctx: &Ctx, report: &RemoveReport) -> anyhow::Result<()> {
    if ctx.json() {
        print_json(report)?;
    } else {
        for name in &report.removed {
            println!("{name}");
        }
    }
    for name in &report.missing {
        eprintln!("{} no such volume: {name}", "error:".red().bold());
    }
    for (name, container) in &report.in_use {
        eprintln!(
            "{} volume {name} is in use by container {}",
            "error:".red().bold(),
            &container[..12.min(container.len())]
        );
    }
    let failed = report.missing.len() + report.in_use.len();
    if failed > 0 {
        bail!("{failed} volume(s) could not be removed");
    }
    Ok(())
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}B")
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}

// ---------------------------------------------------------------
// container
// ---------------------------------------------------------------

fn create_request(args: CreateArgs) -> anyhow::Result<CreateRequest> {
    let mut networks: BTreeMap<String, Vec<IpAddr>> = BTreeMap::new();
    for (net, ip) in parse_pairs(&args.networks, '=', "network")? {
        networks.entry(net).or_default().push(parse_ip(&ip)?);
    }
    let mut extra_hosts = BTreeMap::new();
    for (host, ip) in parse_pairs(&args.extra_hosts, ':', "extra host")? {
        extra_hosts.insert(host, parse_ip(&ip)?);
    }
    Ok(CreateRequest {
        name: args.name,
        image: args.image,
        hostname: args.hostname,
        labels: parse_pairs(&args.labels, '=', "label")?.into_iter().collect(),
        volumes: args.volumes,
        anonymous_volumes: args.anon_volumes,
        networks,
        extra_hosts,
    })
}

fn cmd_container(ctx: &Ctx, action: ContainerAction) -> anyhow::Result<()> {
    let stores = ctx.stores();
    match action {
        ContainerAction::Create(args) => {
            let meta = stores.create_container(&create_request(args)?)?;
            if ctx.json() {
                return print_json(&meta);
            }
            println!("{}", meta.id);
        }
        ContainerAction::Ls => {
            let containers = stores.containers.list()?;
            if ctx.json() {
                return print_json(&containers);
            }
            println!(
                "{:<14} {:<24} {:<10} {}",
                "CONTAINER ID".bold(),
                "IMAGE".bold(),
                "STATUS".bold(),
                "NAMES".bold()
            );
            for c in &containers {
                println!(
                    "{:<14} {:<24} {:<10} {}",
                    c.id.short().yellow(),
                    c.image,
                    c.state.to_string(),
                    c.name
                );
            }
        }
        ContainerAction::Inspect { container } => {
            let id = stores.resolve(&container)?;
            print_json(&stores.containers.get(&id)?)?;
        }
        ContainerAction::Rm { container, volumes } => {
            let meta = stores.remove_container(&container, volumes)?;
            println!("{}", if ctx.json() { meta.id.to_string() } else { meta.name });
        }
        ContainerAction::Rename { container, new_name } => {
            let meta = stores.rename_container(&container, &new_name)?;
            if ctx.json() {
                return print_json(&meta);
            }
            println!("{} {} → {}", "✓".green().bold(), meta.id.short().yellow(), meta.name.bold());
        }
    }
    Ok(())
}

// ---------------------------------------------------------------
// namespace, hosts
// ---------------------------------------------------------------

fn cmd_namespace(ctx: &Ctx, action: NamespaceAction) -> anyhow::Result<()> {
    match action {
        NamespaceAction::Ls => {
            let summaries = list_namespaces(&ctx.store)?;
            if ctx.json() {
                return print_json(&summaries);
            }
            println!(
                "{:<32} {:>10} {:>8} {:>6}",
                "NAME".bold(),
                "CONTAINERS".bold(),
                "VOLUMES".bold(),
                "NAMES".bold()
            );
            for s in &summaries {
                println!("{:<32} {:>10} {:>8} {:>6}", s.name.as_str(), s.containers, s.volumes, s.names);
            }
        }
        NamespaceAction::Rm { name, force } => {
            let namespace = Namespace::new(name).context("invalid namespace")?;
            remove_namespace(&ctx.store, &namespace, force)?;
            println!("{namespace}");
        }
    }
    Ok(())
}

fn cmd_hosts(ctx: &Ctx, action: HostsAction) -> anyhow::Result<()> {
    match action {
        HostsAction::Show { container } => {
            let stores = ctx.stores();
            let id = stores.resolve(&container)?;
            print!("{}", stores.hosts.hosts(&id)?);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------
// debug
// ---------------------------------------------------------------

fn cmd_debug(ctx: &Ctx, action: DebugAction) -> anyhow::Result<()> {
    match action {
        DebugAction::HoldLock { kind, ms } => {
            let kind: BucketKind = kind.parse()?;
            let bucket = ctx.store.bucket(kind, &ctx.namespace);
            let guard = bucket.lock()?;

            // The marker line tells a waiting parent the lock is held.
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "locked {}", guard.path().display())?;
            stdout.flush()?;

            match ms {
                Some(ms) => thread::sleep(Duration::from_millis(ms)),
                None => loop {
                    thread::park();
                },
            }
            guard.release()?;
            writeln!(stdout, "released")?;
            stdout.flush()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_parse() {
        let parsed = parse_pairs(&["a=1".into(), "b=x=y".into()], '=', "label").unwrap();
        assert_eq!(parsed, vec![("a".into(), "1".into()), ("b".into(), "x=y".into())]);
        assert!(parse_pairs(&["novalue".into()], '=', "label").is_err());
        assert!(parse_pairs(&["=v".into()], '=', "label").is_err());
    }

    #[test]
    fn extra_hosts_accept_ipv6() {
        let args = CreateArgs {
            name: Some("web".into()),
            image: "alpine".into(),
            hostname: None,
            volumes: vec![],
            anon_volumes: 0,
            networks: vec!["front=10.0.0.2".into(), "front=fd00::2".into()],
            extra_hosts: vec!["db.local:fd00::9".into()],
            labels: vec![],
        };
        let req = create_request(args).unwrap();
        assert_eq!(req.networks["front"].len(), 2);
        assert_eq!(req.extra_hosts["db.local"], "fd00::9".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn bad_ip_rejected() {
        let args = CreateArgs {
            name: None,
            image: "alpine".into(),
            hostname: None,
            volumes: vec![],
            anon_volumes: 0,
            networks: vec!["front=300.1.1.1".into()],
            extra_hosts: vec![],
            labels: vec![],
        };
        assert!(create_request(args).is_err());
    }

    #[test]
    fn ids_accept_containerd_identifiers() {
        assert_eq!(parse_id("cid123").unwrap().as_str(), "cid123");
        let msg = format!("{:#}", parse_id("a/b").unwrap_err());
        assert_eq!(msg.matches("invalid container ID").count(), 1, "{msg}");
    }

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(human_size(512), "512B");
        assert_eq!(human_size(1500), "1.5KB");
        assert_eq!(human_size(3_000_000), "3.0MB");
    }
}
