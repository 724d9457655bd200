//! Operational driver for INC endpoints: run an echo server, call into it,
//! ping it, or tail its events. Used for manual soak testing of the
//! transports.

use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

use axon::event_loop::{EventLoop, ProcessFlags};
use axon::logging;
use inc::prelude::*;

#[derive(Parser)]
#[command(name = "incnode", about = "iShell INC node driver")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an echo server on the given URL.
    Serve {
        /// tcp://host:port, udp://host:port or unix:///path
        url: String,
        /// Optional TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Call the server's "echo" method once and print the reply.
    Call {
        url: String,
        /// Payload sent to the echo method.
        #[arg(default_value = "hello")]
        payload: String,
    },
    /// Measure an application-level round trip.
    Ping {
        url: String,
        #[arg(long, default_value_t = 4)]
        count: u32,
    },
    /// Subscribe to an event pattern and print what arrives.
    Watch {
        url: String,
        #[arg(default_value = "system.*")]
        pattern: String,
    },
}

fn pump_until<F: FnMut() -> bool>(mut done: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        EventLoop::process_events(ProcessFlags::ALL_EVENTS);
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn connect(url: &str, log: &logging::Logger) -> Result<Context, i32> {
    let context = Context::new("incnode", log);

    let mut config = ContextConfig::default();
    config.auto_reconnect = false;
    context.set_config(config);

    let code = context.connect(url);
    if code != OK {
        logging::error!(log, "connect failed"; "url" => url, "code" => code);
        return Err(code);
    }

    if !pump_until(
        || {
            matches!(
                context.state(),
                ContextState::Ready | ContextState::Failed
            )
        },
        Duration::from_secs(5),
    ) || context.state() != ContextState::Ready
    {
        logging::error!(log, "session did not become ready"; "url" => url);
        return Err(IncError::ConnectionFailed.code());
    }

    Ok(context)
}

fn serve(url: &str, config: Option<&str>, log: &logging::Logger) -> i32 {
    let server = Server::new("incnode", log);

    let mut server_config = match config {
        Some(path) => match ServerConfig::load(path) {
            Ok(config) => config,
            Err(_) => {
                logging::error!(log, "failed to load config"; "path" => path);
                return IncError::InvalidArgs.code();
            }
        },
        None => ServerConfig::default(),
    };
    server_config.enable_io_thread = true;
    server.set_config(server_config);

    let method_log = log.clone();
    server.set_method_handler(Box::new(move |conn, sequence, method, version, args| {
        logging::info!(method_log, "method call";
                       "method" => method.to_string(),
                       "version" => version,
                       "args_len" => args.len());

        match method {
            "echo" => conn.send_reply(sequence, OK, args),
            _ => conn.send_reply(sequence, IncError::InvalidArgs.code(), &[]),
        }
    }));

    let code = server.listen_on(url);
    if code != OK {
        logging::error!(log, "listen failed"; "url" => url, "code" => code);
        return code;
    }

    logging::info!(log, "echo server running"; "url" => url);
    EventLoop::new().exec()
}

fn call(url: &str, payload: &str, log: &logging::Logger) -> i32 {
    let context = match connect(url, log) {
        Ok(context) => context,
        Err(code) => return code,
    };

    let op = context.call_method("echo", 1, payload.as_bytes(), None);
    if !pump_until(|| op.state().is_terminal(), Duration::from_secs(5)) {
        logging::error!(log, "no reply");
        return IncError::Timeout.code();
    }

    if op.error_code() != OK {
        logging::error!(log, "call failed"; "code" => op.error_code());
        return op.error_code();
    }

    println!("{}", String::from_utf8_lossy(&op.result()));
    context.disconnect();
    OK
}

fn ping(url: &str, count: u32, log: &logging::Logger) -> i32 {
    let context = match connect(url, log) {
        Ok(context) => context,
        Err(code) => return code,
    };

    for round in 0..count {
        let started = Instant::now();
        let op = context.pingpong();

        if !pump_until(|| op.state().is_terminal(), Duration::from_secs(5))
            || op.error_code() != OK
        {
            logging::error!(log, "ping lost"; "round" => round);
            return IncError::Timeout.code();
        }

        println!("pong {} in {:?}", round, started.elapsed());
    }

    context.disconnect();
    OK
}

fn watch(url: &str, pattern: &str, log: &logging::Logger) -> i32 {
    use axon::meta::OBJECT_META;
    use axon::object::{self, ConnectionType, Object, SlotTag};
    use std::sync::Arc;

    let context = match connect(url, log) {
        Ok(context) => context,
        Err(code) => return code,
    };

    let sink = Object::new(&OBJECT_META, "watch-sink", log);
    object::connect(
        context.object(),
        &inc::context::signals::EVENT_RECEIVED,
        &sink,
        SlotTag::ANONYMOUS,
        3,
        ConnectionType::DIRECT,
        Arc::new(|_, args| {
            let name = args[0].get::<String>().unwrap_or_default();
            let version = args[1].get::<u16>().unwrap_or(0);
            let data = args[2].get::<Vec<u8>>().unwrap_or_default();
            println!("{} v{} ({} bytes)", name, version, data.len());
        }),
    );

    let op = context.subscribe(pattern);
    if !pump_until(|| op.state().is_terminal(), Duration::from_secs(5))
        || op.error_code() != OK
    {
        logging::error!(log, "subscribe refused"; "pattern" => pattern);
        return IncError::AccessDenied.code();
    }

    logging::info!(log, "watching"; "pattern" => pattern);
    EventLoop::new().exec()
}

fn main() {
    let cli = Cli::parse();
    let log = logging::terminal();

    let code = match &cli.command {
        Command::Serve { url, config } => serve(url, config.as_deref(), &log),
        Command::Call { url, payload } => call(url, payload, &log),
        Command::Ping { url, count } => ping(url, *count, &log),
        Command::Watch { url, pattern } => watch(url, pattern, &log),
    };

    std::process::exit(code);
}
