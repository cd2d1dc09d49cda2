use clap::Parser;
use log::error;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Mints a bearer token for the DocSign API.")]
struct Args {
    #[clap(short, long, help = "Email address of the user.")]
    email: String,
    #[clap(short, long, help = "Display name shown to signers.")]
    name: Option<String>,
    #[clap(short, long, help = "User ID; a new one is generated when omitted.")]
    user_id: Option<uuid::Uuid>,
    #[clap(short, long, default_value_t = 24, help = "Token lifetime in hours.")]
    ttl_hours: i64,
}

fn main() {
    pretty_env_logger::init();
    let args = Args::parse();

    let config = match docsign::figment().extract::<docsign::Config>() {
        Ok(c) => c,
        Err(err) => {
            error!("Unable to read config: {}", err);
            std::process::exit(1);
        }
    };

    let claims = docsign::auth::Claims::new(
        args.user_id.unwrap_or_else(uuid::Uuid::new_v4),
        args.email,
        args.name,
        chrono::Duration::hours(args.ttl_hours),
    );

    match docsign::auth::issue_token(&claims, &config.token_key) {
        Ok(token) => {
            eprintln!("User ID: {}", claims.sub);
            println!("{}", token);
        }
        Err(err) => {
            error!("Unable to issue token: {}", err);
            std::process::exit(1);
        }
    }
}
