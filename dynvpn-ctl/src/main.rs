use exitcode::ExitCode;

use std::process;

mod cli;

use cli::Command;

enum Method {
    Get,
    Post,
}

fn request_parts(command: &Command) -> (Method, String) {
    match command {
        Command::Status {} => (Method::Get, "node_state".to_string()),
        Command::DebugState {} => (Method::Get, "debug_state".to_string()),
        Command::SetOnline { name } => (Method::Post, format!("vpn/set_online/{name}")),
        Command::SetOffline { name } => (Method::Post, format!("vpn/set_offline/{name}")),
        Command::SetReplica { name } => (Method::Post, format!("vpn/set_replica/{name}")),
        Command::Restart { name } => (Method::Post, format!("vpn/restart/{name}")),
        Command::Shutdown {} => (Method::Post, "shutdown".to_string()),
        Command::SetReplicaMode { mode } => (Method::Post, format!("set_replica_mode/{mode}")),
    }
}

#[tokio::main]
async fn main() {
    let args = cli::parse();
    process::exit(run(args).await);
}

async fn run(args: cli::Cli) -> ExitCode {
    let (method, path) = request_parts(&args.command);
    let url = match args.endpoint.join(&path) {
        Ok(url) => url,
        Err(e) => {
            eprintln!("Invalid endpoint: {e}");
            return exitcode::USAGE;
        }
    };

    let client = reqwest::Client::new();
    let request = match method {
        Method::Get => client.get(url),
        Method::Post => client.post(url),
    };

    let resp = match request.send().await {
        Ok(resp) => resp,
        Err(e) => {
            eprintln!("Error contacting coordinator: {e}");
            return exitcode::UNAVAILABLE;
        }
    };

    // the control API reports application errors inside a 200 response
    if !resp.status().is_success() {
        eprintln!("Unexpected response status {}", resp.status());
        return exitcode::PROTOCOL;
    }

    let text = match resp.text().await {
        Ok(text) => text,
        Err(e) => {
            eprintln!("Error reading response: {e}");
            return exitcode::IOERR;
        }
    };

    if args.json {
        println!("{}", text.trim_end());
    }

    let value = match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(value) => value,
        Err(e) => {
            eprintln!("Error parsing response: {e}");
            return exitcode::PROTOCOL;
        }
    };

    if let Some(error) = value.get("error").and_then(|e| e.as_str()) {
        if !args.json {
            eprintln!("Error: {error}");
        }
        return exitcode::PROTOCOL;
    }

    if !args.json {
        match args.command {
            Command::Status {} | Command::DebugState {} => println!("{}", text.trim_end()),
            _ => println!("OK"),
        }
    }

    exitcode::OK
}
