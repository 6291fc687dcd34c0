use serde::Deserialize;

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// The base url of the brandforge api server. ex: http://127.0.0.1:8080
    pub server: String,
}
