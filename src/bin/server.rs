use log::info;

#[tokio::main]
async fn main() -> Result<(), rocket::Error> {
    pretty_env_logger::init();

    let app = docsign::setup().await;

    info!("DocSign server starting...");

    app.rocket
        .mount("/", docsign::views::routes())
        .register("/", docsign::views::catchers())
        .launch()
        .await?;

    Ok(())
}
