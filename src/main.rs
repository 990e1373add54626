mod app;
mod contact;
mod engagement;
mod export;
mod knowledge;
mod lang;
mod notify;
mod pages;
mod prompting;
mod types;

#[tokio::main]
async fn main() {
    app::run().await;
}
