//! `Accept` header parsing and best-offer selection.

/// One parsed `Accept` entry: `type/subtype` plus quality.
#[derive(Debug, Clone, PartialEq)]
struct AcceptEntry {
    main: String,
    sub: String,
    quality: f32,
}

impl AcceptEntry {
    /// Specificity rank used to break quality ties: exact > `type/*` > `*/*`.
    fn specificity(&self) -> u8 {
        match (self.main.as_str(), self.sub.as_str()) {
            ("*", _) => 0,
            (_, "*") => 1,
            _ => 2,
        }
    }

    fn matches(&self, main: &str, sub: &str) -> bool {
        (self.main == "*" || self.main.eq_ignore_ascii_case(main))
            && (self.sub == "*" || self.sub.eq_ignore_ascii_case(sub))
    }
}

fn parse_accept(header: &str) -> Vec<AcceptEntry> {
    header
        .split(',')
        .filter_map(|item| {
            let mut parts = item.split(';');
            let mime = parts.next()?.trim();
            if mime.is_empty() {
                return None;
            }
            let (main, sub) = mime.split_once('/')?;
            let mut quality = 1.0f32;
            for param in parts {
                let param = param.trim();
                if let Some(q) = param.strip_prefix("q=") {
                    quality = q.trim().parse().unwrap_or(0.0);
                }
            }
            Some(AcceptEntry {
                main: main.trim().to_ascii_lowercase(),
                sub: sub.trim().to_ascii_lowercase(),
                quality,
            })
        })
        .collect()
}

/// Pick the best offer for an `Accept` header.
///
/// Returns the index into `offers` of the winning content type, or `None`
/// when nothing is acceptable. A missing or empty header accepts anything
/// (first offer wins). Ties on quality go to the earlier offer.
pub fn best_offer(accept: Option<&str>, offers: &[&str]) -> Option<usize> {
    let header = match accept {
        Some(h) if !h.trim().is_empty() => h,
        _ => return if offers.is_empty() { None } else { Some(0) },
    };

    let entries = parse_accept(header);
    let mut best: Option<(usize, f32, u8)> = None;

    for (idx, offer) in offers.iter().enumerate() {
        let (main, sub) = match offer.split_once('/') {
            Some(pair) => pair,
            None => continue,
        };
        // the most specific matching entry decides this offer's quality
        let matched = entries
            .iter()
            .filter(|e| e.matches(main, sub))
            .max_by(|a, b| {
                a.specificity()
                    .cmp(&b.specificity())
                    .then(a.quality.total_cmp(&b.quality))
            });
        if let Some(entry) = matched {
            if entry.quality <= 0.0 {
                continue;
            }
            let candidate = (idx, entry.quality, entry.specificity());
            match best {
                Some((_, q, _)) if entry.quality <= q => {}
                _ => best = Some(candidate),
            }
        }
    }

    best.map(|(idx, _, _)| idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_wins() {
        let offers = ["text/plain", "application/json"];
        assert_eq!(best_offer(Some("text/plain"), &offers), Some(0));
        assert_eq!(best_offer(Some("application/json"), &offers), Some(1));
    }

    #[test]
    fn no_match_is_none() {
        let offers = ["text/plain", "application/json"];
        assert_eq!(best_offer(Some("application/xml"), &offers), None);
    }

    #[test]
    fn wildcard_accepts_first_offer() {
        let offers = ["text/plain", "application/json"];
        assert_eq!(best_offer(Some("*/*"), &offers), Some(0));
    }

    #[test]
    fn quality_ordering() {
        let offers = ["text/plain", "application/json"];
        assert_eq!(
            best_offer(Some("text/plain;q=0.3, application/json;q=0.9"), &offers),
            Some(1)
        );
    }

    #[test]
    fn zero_quality_is_unacceptable() {
        let offers = ["text/plain"];
        assert_eq!(best_offer(Some("text/plain;q=0"), &offers), None);
    }

    #[test]
    fn missing_header_accepts_anything() {
        let offers = ["application/json"];
        assert_eq!(best_offer(None, &offers), Some(0));
    }

    #[test]
    fn subtype_wildcard() {
        let offers = ["application/json", "text/html"];
        assert_eq!(best_offer(Some("text/*"), &offers), Some(1));
    }
}
