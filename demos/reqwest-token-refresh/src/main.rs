use std::time::Duration;

use reauth::{
    CredentialPair, CredentialStore, FileCredentialStorage, HttpClient, RefreshConfig,
    RenewalError,
};
use url::Url;

#[tokio::main]
async fn main() -> reauth::Result<()> {
    let config = RefreshConfig::builder()
        .base_url(Url::parse("https://api.example.com")?)
        .renewal_timeout(Duration::from_secs(10))
        .build();

    // Credentials survive restarts. A previous session is picked up from the file.
    let store = CredentialStore::open(FileCredentialStorage::new("session.json"));
    let renewer = reauth::HttpRenewalClient::from_config(&config)?;
    let client = HttpClient::builder(config, renewer)
        .store(store)
        .client(reqwest::Client::new())
        .sign_out(|reason: &RenewalError| {
            // Navigate to the sign-in screen here.
            eprintln!("Signed out: {reason}");
        })
        .build();

    if client.credentials().is_none() {
        // Tokens as returned by the sign-in endpoint.
        client.sign_in(&CredentialPair::new("my-access-token", "my-refresh-token"))?;
    }

    // The authorization header is added automatically. An expired access token is
    // renewed once and the request is sent again.
    let response = client.get("https://api.example.com/rewards").send().await?;
    println!("{}", response.status());

    Ok(())
}
