use std::env;
use std::error::Error;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use petlink::config::{db_path, DeviceConfig, DEFAULT_PORT, DISCOVERY_TIMEOUT};
use petlink::coordinator::{send_accept_notice, Response, SocialCoordinator};
use petlink::delivery::DeliveryEngine;
use petlink::discovery;
use petlink::friends::FriendEngine;
use petlink::handlers::Notifications;
use petlink::logging;
use petlink::protocol::{ContentType, LocalIdentity};
use petlink::storage::Storage;
use petlink::transport::{TcpWire, Wire};

fn main() {
    logging::init();
    if let Err(error) = run() {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let mut args = env::args().collect::<Vec<String>>();
    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    let command = args[1].clone();
    let command_args = args.split_off(2);

    match command.as_str() {
        "init" => init_device(&command_args),
        "start" => start_daemon(),
        "discover" => discover_peers(&command_args),
        "friends" => list_friends(),
        "requests" => list_requests(),
        "accept" => respond(&command_args, Response::Accept),
        "reject" => respond(&command_args, Response::Reject),
        "send" => send_message(&command_args),
        "inbox" => show_inbox(),
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    eprintln!("petlink - social subsystem for networked pet devices");
    eprintln!();
    eprintln!("usage: petlink <command> [args]");
    eprintln!();
    eprintln!("  init <display-name> [port]   create device.toml in the data dir");
    eprintln!("  start                        run the subsystem in the foreground");
    eprintln!("  discover [seconds]           probe the LAN for peers");
    eprintln!("  friends                      list friends");
    eprintln!("  requests                     list pending friend requests");
    eprintln!("  accept <request-id>          accept a friend request");
    eprintln!("  reject <request-id>          reject a friend request");
    eprintln!("  send <device-id> <text>      send a text message to a friend");
    eprintln!("  inbox                        list received messages");
    eprintln!();
    eprintln!("data dir: $PETLINK_DIR (default \".\")");
}

fn data_dir() -> PathBuf {
    env::var("PETLINK_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn load_config() -> Result<DeviceConfig, Box<dyn Error>> {
    DeviceConfig::load(&data_dir())?
        .ok_or_else(|| "no device.toml found, run `petlink init <display-name>` first".into())
}

fn open_storage() -> Result<Storage, Box<dyn Error>> {
    Ok(Storage::open(&db_path(&data_dir()))?)
}

fn local_identity(config: &DeviceConfig) -> LocalIdentity {
    LocalIdentity::new(config.device_id.clone(), config.display_name.clone(), config.port)
}

fn init_device(args: &[String]) -> Result<(), Box<dyn Error>> {
    let Some(display_name) = args.first() else {
        return Err("usage: petlink init <display-name> [port]".into());
    };
    let port = match args.get(1) {
        Some(raw) => raw.parse::<u16>()?,
        None => DEFAULT_PORT,
    };
    let dir = data_dir();
    if DeviceConfig::load(&dir)?.is_some() {
        return Err(format!("{} already contains a device.toml", dir.display()).into());
    }
    let config = DeviceConfig::generate(display_name.as_str(), port);
    config.save(&dir)?;
    println!("device {} ({display_name}) on port {port}", config.device_id);
    Ok(())
}

fn start_daemon() -> Result<(), Box<dyn Error>> {
    let config = load_config()?;
    let storage = open_storage()?;
    let notifications = Notifications {
        on_friend_request: Some(Box::new(|row| {
            println!(
                "friend request #{} from {} ({})",
                row.id, row.from_display_name, row.from_device_id
            );
        })),
        on_request_accepted: Some(Box::new(|friend| {
            println!("{} ({}) accepted", friend.display_name, friend.device_id);
        })),
        on_message: Some(Box::new(|message| {
            println!("{}: {}", message.from_display_name, message.content);
        })),
    };

    let mut coordinator = SocialCoordinator::start(&config, storage, notifications)?;
    println!(
        "petlink running as {} ({}) on port {}",
        config.display_name,
        coordinator.device_id(),
        coordinator.listen_port()
    );

    loop {
        coordinator.pump_events();
        thread::sleep(Duration::from_millis(250));
    }
}

fn discover_peers(args: &[String]) -> Result<(), Box<dyn Error>> {
    let config = load_config()?;
    let timeout = match args.first() {
        Some(raw) => Duration::from_secs(raw.parse::<u64>()?),
        None => DISCOVERY_TIMEOUT,
    };
    let peers = discovery::discover(
        &local_identity(&config),
        petlink::config::DISCOVERY_PORT,
        timeout,
    )?;
    if peers.is_empty() {
        println!("no peers found");
        return Ok(());
    }
    for peer in peers {
        println!(
            "{}  {}  {}:{}",
            peer.device_id, peer.display_name, peer.addr, peer.port
        );
    }
    Ok(())
}

fn list_friends() -> Result<(), Box<dyn Error>> {
    let storage = open_storage()?;
    let friends = storage.list_friends()?;
    if friends.is_empty() {
        println!("no friends yet");
        return Ok(());
    }
    let now = unix_now();
    for friend in friends {
        let addr = match (&friend.last_addr, friend.last_port) {
            (Some(addr), Some(port)) => format!("{addr}:{port}"),
            _ => "address unknown".to_string(),
        };
        // Recently seen counts as online; otherwise ask the device directly.
        let reachable = friend.is_online(now)
            || match (&friend.last_addr, friend.last_port) {
                (Some(addr), Some(port)) => TcpWire.probe(addr, port),
                _ => false,
            };
        let presence = if reachable { "online" } else { "offline" };
        println!(
            "{}  {}  {addr}  {presence}",
            friend.device_id, friend.display_name
        );
    }
    Ok(())
}

fn list_requests() -> Result<(), Box<dyn Error>> {
    let config = load_config()?;
    let storage = open_storage()?.into_shared();
    let engine = FriendEngine::new(storage, config.device_id);
    let requests = engine.pending_requests(unix_now())?;
    if requests.is_empty() {
        println!("no pending requests");
        return Ok(());
    }
    for request in requests {
        println!(
            "#{}  {}  ({})  expires at {}",
            request.id, request.from_display_name, request.from_device_id, request.expires_at
        );
    }
    Ok(())
}

fn respond(args: &[String], response: Response) -> Result<(), Box<dyn Error>> {
    let Some(raw_id) = args.first() else {
        return Err("usage: petlink accept|reject <request-id>".into());
    };
    let id = raw_id.parse::<i64>()?;
    let config = load_config()?;
    let storage = open_storage()?.into_shared();
    let engine = FriendEngine::new(storage.clone(), config.device_id.clone());
    let now = unix_now();
    match response {
        Response::Reject => {
            engine.reject(id, now)?;
            println!("request #{id} rejected");
        }
        Response::Accept => {
            let outcome = engine.accept(id, now)?;
            if outcome.newly_accepted {
                send_accept_notice(&TcpWire, &storage, &local_identity(&config), &outcome.friend, now);
            }
            println!(
                "now friends with {} ({})",
                outcome.friend.display_name, outcome.friend.device_id
            );
        }
    }
    Ok(())
}

fn send_message(args: &[String]) -> Result<(), Box<dyn Error>> {
    let (Some(device_id), Some(content)) = (args.first(), args.get(1)) else {
        return Err("usage: petlink send <device-id> <text>".into());
    };
    let config = load_config()?;
    let storage = open_storage()?.into_shared();
    let engine = DeliveryEngine::new(storage, TcpWire, local_identity(&config));
    let message_id = engine.send(device_id, ContentType::Text, content, None, unix_now())?;
    let queued = engine.queue_len()? > 0;
    if queued {
        println!("queued {message_id} (peer unreachable, will retry)");
    } else {
        println!("delivered {message_id}");
    }
    Ok(())
}

fn show_inbox() -> Result<(), Box<dyn Error>> {
    let storage = open_storage()?;
    let messages = storage.inbox(50)?;
    if messages.is_empty() {
        println!("inbox empty");
        return Ok(());
    }
    for message in messages {
        println!(
            "[{}] {}  {}: {}",
            message.status.as_str(),
            message.sent_at,
            message.from_display_name,
            message.content
        );
    }
    Ok(())
}
