//! Coarse user-agent classification done once on receipt.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static ANDROID_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Android (\d+(?:\.\d+)*)").expect("valid regex"));
static IOS_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"OS (\d+(?:_\d+)*) like Mac OS X").expect("valid regex"));
static MACOS_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Mac OS X (\d+(?:[_.]\d+)*)").expect("valid regex"));
static WINDOWS_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Windows NT (\d+\.\d+)").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceType {
    Mobile,
    Tablet,
    Desktop,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Mobile => "Mobile",
            DeviceType::Tablet => "Tablet",
            DeviceType::Desktop => "Desktop",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAgentInfo {
    pub device_type: DeviceType,
    pub browser: String,
    pub operating_system: String,
    pub os_version: Option<String>,
}

pub fn classify(user_agent: &str) -> UserAgentInfo {
    let (operating_system, os_version) = detect_os(user_agent);
    UserAgentInfo {
        device_type: detect_device(user_agent),
        browser: detect_browser(user_agent).to_string(),
        operating_system: operating_system.to_string(),
        os_version,
    }
}

fn capture(re: &Regex, haystack: &str) -> Option<String> {
    re.captures(haystack)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().replace('_', "."))
}

fn detect_os(ua: &str) -> (&'static str, Option<String>) {
    if ua.contains("iPhone") || ua.contains("iPad") || ua.contains("iPod") {
        return ("iOS", capture(&IOS_VERSION, ua));
    }
    if ua.contains("Android") {
        return ("Android", capture(&ANDROID_VERSION, ua));
    }
    if ua.contains("CrOS") {
        return ("Chrome OS", None);
    }
    if ua.contains("Win") {
        let version = capture(&WINDOWS_VERSION, ua).map(|nt| windows_release(&nt));
        return ("Windows", version);
    }
    if ua.contains("Mac") {
        return ("MacOS", capture(&MACOS_VERSION, ua));
    }
    if ua.contains("Linux") {
        return ("Linux", None);
    }
    ("Other", None)
}

fn windows_release(nt: &str) -> String {
    match nt {
        "10.0" => "10".into(),
        "6.3" => "8.1".into(),
        "6.2" => "8".into(),
        "6.1" => "7".into(),
        other => format!("NT {other}"),
    }
}

fn detect_device(ua: &str) -> DeviceType {
    if ua.contains("iPad") || ua.contains("Tablet") {
        return DeviceType::Tablet;
    }
    if ua.contains("Android") && !ua.contains("Mobile") {
        return DeviceType::Tablet;
    }
    if ua.contains("Mobi") || ua.contains("iPhone") || ua.contains("iPod") {
        return DeviceType::Mobile;
    }
    DeviceType::Desktop
}

fn detect_browser(ua: &str) -> &'static str {
    if ua.contains("Edg/") || ua.contains("EdgA/") || ua.contains("EdgiOS/") {
        "Edge"
    } else if ua.contains("OPR/") || ua.contains("Opera") {
        "Opera"
    } else if ua.contains("SamsungBrowser/") {
        "Samsung Internet"
    } else if ua.contains("Firefox/") || ua.contains("FxiOS/") {
        "Firefox"
    } else if ua.contains("CriOS/") || ua.contains("Chrome/") {
        "Chrome"
    } else if ua.contains("Safari/") {
        "Safari"
    } else {
        "Other"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_chrome_desktop() {
        let info = classify(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        );
        assert_eq!(info.device_type, DeviceType::Desktop);
        assert_eq!(info.browser, "Chrome");
        assert_eq!(info.operating_system, "Windows");
        assert_eq!(info.os_version.as_deref(), Some("10"));
    }

    #[test]
    fn iphone_safari_is_ios_not_mac() {
        let info = classify(
            "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4_1 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
        );
        assert_eq!(info.device_type, DeviceType::Mobile);
        assert_eq!(info.browser, "Safari");
        assert_eq!(info.operating_system, "iOS");
        assert_eq!(info.os_version.as_deref(), Some("17.4.1"));
    }

    #[test]
    fn android_phone_and_tablet() {
        let phone = classify(
            "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Mobile Safari/537.36",
        );
        assert_eq!(phone.operating_system, "Android");
        assert_eq!(phone.os_version.as_deref(), Some("14"));
        assert_eq!(phone.device_type, DeviceType::Mobile);

        let tablet = classify(
            "Mozilla/5.0 (Linux; Android 13; SM-X700) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        );
        assert_eq!(tablet.device_type, DeviceType::Tablet);
    }

    #[test]
    fn mac_firefox_and_linux_edge() {
        let mac = classify(
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:125.0) Gecko/20100101 Firefox/125.0",
        );
        assert_eq!(mac.operating_system, "MacOS");
        assert_eq!(mac.os_version.as_deref(), Some("10.15"));
        assert_eq!(mac.browser, "Firefox");

        let linux = classify(
            "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0",
        );
        assert_eq!(linux.operating_system, "Linux");
        assert_eq!(linux.browser, "Edge");
        assert!(linux.os_version.is_none());
    }

    #[test]
    fn empty_agent_is_other_desktop() {
        let info = classify("");
        assert_eq!(info.operating_system, "Other");
        assert_eq!(info.browser, "Other");
        assert_eq!(info.device_type, DeviceType::Desktop);
    }
}
