use std::env;

const USAGE: &str = "Usage: runway run [flags] | runway serve [port]";

#[tokio::main]
async fn main() {
    env_logger::init();

    let raw_args: Vec<String> = env::args().collect();
    match raw_args.get(1).map(|s| s.as_str()) {
        Some("serve") => {
            let port = raw_args
                .get(2)
                .and_then(|s| s.parse::<u16>().ok())
                .unwrap_or(8080);
            if let Err(e) = runway::api::run_http_server(port).await {
                eprintln!("Server error: {e}");
                std::process::exit(1);
            }
        }
        Some("run") => {
            let args = std::iter::once("runway".to_string()).chain(raw_args.into_iter().skip(2));
            match runway::api::run_cli(args) {
                Ok(json) => println!("{json}"),
                Err(msg) => {
                    eprintln!("{msg}");
                    std::process::exit(1);
                }
            }
        }
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    }
}
