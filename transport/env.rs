// Environment variable helpers shared by the server and client configs
use std::env;
use std::str::FromStr;

/// Parse `key` as `T`. Unset or unparsable values give `None`.
pub fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// `1`, `true`, `yes` and `on` are true; any other set value is false.
pub fn env_flag(key: &str) -> Option<bool> {
    env::var(key).ok().map(|s| matches!(s.trim(), "1" | "true" | "yes" | "on"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_falls_back() {
        // Keys unique to this test so parallel tests are unaffected
        env::set_var("NREPL_TEST_ENV_PORT", " 7889 ");
        env::set_var("NREPL_TEST_ENV_FLAG", "true");
        env::set_var("NREPL_TEST_ENV_OFF", "nope");
        env::set_var("NREPL_TEST_ENV_BAD", "not-a-number");
        assert_eq!(env_parse::<u16>("NREPL_TEST_ENV_PORT"), Some(7889));
        assert_eq!(env_flag("NREPL_TEST_ENV_FLAG"), Some(true));
        assert_eq!(env_flag("NREPL_TEST_ENV_OFF"), Some(false));
        assert_eq!(env_flag("NREPL_TEST_ENV_UNSET"), None);
        assert_eq!(env_parse::<u16>("NREPL_TEST_ENV_BAD"), None);
        assert_eq!(env_parse::<u16>("NREPL_TEST_ENV_UNSET"), None);
    }
}
