//! Topic-to-course resolution.
//!
//! Meeting topics rarely match LMS course names exactly, so resolution runs
//! a cascade of lookup strategies over the raw topic, then over normalized
//! variants of it, then over progressively right-truncated forms, before
//! falling back to the configured default course.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::clients::lms::Course;
use crate::{Error, Result};

/// Read-side course lookups the resolver consumes.
#[async_trait]
pub trait CourseDirectory: Send + Sync {
    async fn all_courses(&self) -> Result<Vec<Course>>;
    async fn courses_by_field(&self, field: &str, value: &str) -> Result<Vec<Course>>;
    async fn search_courses(&self, text: &str) -> Result<Vec<Course>>;
}

/// Course resolver with a TTL-cached course list.
pub struct CourseResolver {
    directory: Arc<dyn CourseDirectory>,
    default_course_id: Option<i64>,
    cache_ttl: Duration,
    cache: Mutex<Option<(Instant, Arc<Vec<Course>>)>>,
}

impl CourseResolver {
    pub fn new(
        directory: Arc<dyn CourseDirectory>,
        default_course_id: Option<i64>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            directory,
            default_course_id,
            cache_ttl,
            cache: Mutex::new(None),
        }
    }

    /// Resolve a topic to a numeric course id.
    pub async fn resolve(&self, topic: &str) -> Result<i64> {
        for candidate in candidate_forms(topic) {
            if let Some(course_id) = self.cascade(&candidate).await {
                info!("resolver: topic '{}' matched course {} via '{}'", topic, course_id, candidate);
                return Ok(course_id);
            }
        }

        if let Some(default) = self.default_course_id {
            info!("resolver: topic '{}' fell back to default course {}", topic, default);
            return Ok(default);
        }

        Err(Error::NoCourseResolved(topic.to_string()))
    }

    /// One full lookup cascade over a single candidate string.
    async fn cascade(&self, candidate: &str) -> Option<i64> {
        if let Some(course) = self.exact_match(candidate).await {
            return Some(course);
        }

        for field in ["fullname", "shortname"] {
            match self.directory.courses_by_field(field, candidate).await {
                Ok(courses) if !courses.is_empty() => return Some(courses[0].id),
                Ok(_) => {}
                Err(err) => debug!("resolver: by-field {} lookup failed: {}", field, err),
            }
        }

        match self.directory.search_courses(candidate).await {
            Ok(courses) if !courses.is_empty() => Some(courses[0].id),
            Ok(_) => None,
            Err(err) => {
                debug!("resolver: search lookup failed: {}", err);
                None
            }
        }
    }

    async fn exact_match(&self, candidate: &str) -> Option<i64> {
        let courses = self.cached_courses().await?;
        let wanted = candidate.trim().to_lowercase();

        courses
            .iter()
            .find(|c| {
                c.fullname.trim().to_lowercase() == wanted
                    || c.displayname
                        .as_deref()
                        .is_some_and(|d| d.trim().to_lowercase() == wanted)
            })
            .map(|c| c.id)
    }

    async fn cached_courses(&self) -> Option<Arc<Vec<Course>>> {
        {
            let cache = self.cache.lock();
            if let Some((fetched_at, courses)) = cache.as_ref() {
                if fetched_at.elapsed() < self.cache_ttl {
                    return Some(Arc::clone(courses));
                }
            }
        }

        match self.directory.all_courses().await {
            Ok(courses) => {
                let courses = Arc::new(courses);
                *self.cache.lock() = Some((Instant::now(), Arc::clone(&courses)));
                Some(courses)
            }
            Err(err) => {
                debug!("resolver: course list fetch failed: {}", err);
                None
            }
        }
    }
}

/// All candidate strings for a topic, in resolution order: the raw topic,
/// its normalized variants, then progressive right-truncations.
fn candidate_forms(topic: &str) -> Vec<String> {
    let mut forms = vec![topic.trim().to_string()];

    for variant in normalized_variants(topic) {
        if !forms.contains(&variant) {
            forms.push(variant);
        }
    }

    for truncated in right_truncations(topic) {
        if !forms.contains(&truncated) {
            forms.push(truncated);
        }
    }

    forms.retain(|f| !f.is_empty());
    forms
}

/// Normalized variants, derived by repeatedly applying the ordered
/// transforms until none of them changes the working string:
/// trailing-parenthetical trim, separator left-segment, trailing
/// uppercase-suffix strip.
fn normalized_variants(topic: &str) -> Vec<String> {
    let transforms: [fn(&str) -> String; 3] = [
        trim_trailing_parenthetical,
        separator_left_segment,
        strip_trailing_upper_suffix,
    ];

    let mut variants = Vec::new();
    let mut current = topic.trim().to_string();

    loop {
        let mut changed = false;
        for transform in transforms {
            let next = transform(&current);
            if next != current && !next.is_empty() {
                current = next;
                variants.push(current.clone());
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    variants
}

/// Remove a trailing `(...)` or `[...]` group.
fn trim_trailing_parenthetical(input: &str) -> String {
    let trimmed = input.trim_end();
    let open = if trimmed.ends_with(')') {
        '('
    } else if trimmed.ends_with(']') {
        '['
    } else {
        return input.trim().to_string();
    };

    match trimmed.rfind(open) {
        Some(idx) => trimmed[..idx].trim().to_string(),
        None => input.trim().to_string(),
    }
}

/// Left segment of a split on any of `-`, `–`, `—`, `:`, `|`.
fn separator_left_segment(input: &str) -> String {
    match input.find(['-', '–', '—', ':', '|']) {
        Some(idx) => input[..idx].trim().to_string(),
        None => input.trim().to_string(),
    }
}

/// Strip a trailing 1-3 letter all-uppercase token (e.g. "EP").
fn strip_trailing_upper_suffix(input: &str) -> String {
    let trimmed = input.trim();
    let Some(last) = trimmed.split_whitespace().last() else {
        return trimmed.to_string();
    };

    let is_upper_suffix =
        (1..=3).contains(&last.len()) && last.chars().all(|c| c.is_ascii_uppercase());

    if is_upper_suffix && last.len() < trimmed.len() {
        trimmed[..trimmed.len() - last.len()].trim().to_string()
    } else {
        trimmed.to_string()
    }
}

/// Drop the last word, then the last two, then the last three, requiring at
/// least two words to remain.
fn right_truncations(topic: &str) -> Vec<String> {
    let words: Vec<&str> = topic.split_whitespace().collect();
    let mut out = Vec::new();

    for dropped in 1..=3usize {
        if words.len() < dropped + 2 {
            break;
        }
        out.push(words[..words.len() - dropped].join(" "));
    }

    out
}
