use crate::models::{OwnerRef, Record};
use crate::records::traits::{RecordPage, RecordQuery, RecordSource};
use crate::Result;

/// Resolve the source-side owner id.
///
/// A pre-known id from the directory wins. Otherwise the source is asked by
/// email, which is logged as degraded mode. `Ok(None)` means unresolved; the
/// caller should treat the owner as having no records.
#[tracing::instrument(level = "debug", skip(source), fields(source = source.id(), owner = %owner.name))]
pub async fn resolve_owner_id(
    source: &dyn RecordSource,
    owner: &OwnerRef,
) -> Result<Option<String>> {
    if let Some(id) = owner.crm_owner_id.as_deref().map(str::trim) {
        if !id.is_empty() {
            return Ok(Some(id.to_string()));
        }
    }
    let Some(email) = owner
        .email
        .as_deref()
        .map(str::trim)
        .filter(|e| !e.is_empty())
    else {
        tracing::warn!(owner = %owner.name, "owner has neither a crm owner id nor an email; skipping fetch");
        return Ok(None);
    };

    tracing::warn!(
        owner = %owner.name,
        email,
        "crm owner id missing from directory; resolving by email (degraded mode)"
    );
    let resolved = source.lookup_owner_id(email).await?;
    if resolved.is_none() {
        tracing::warn!(owner = %owner.name, email, "owner could not be resolved; treating as empty");
    }
    Ok(resolved)
}

/// Follow the pagination cursor until exhausted or `query.cap` is reached.
///
/// Any page error ends the fetch; pages are not retried.
#[tracing::instrument(level = "info", skip(source, query), fields(source = source.id()))]
pub async fn fetch_all(
    source: &dyn RecordSource,
    owner_id: &str,
    query: &RecordQuery,
) -> Result<Vec<Record>> {
    let mut out: Vec<Record> = Vec::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0u32;
    loop {
        let RecordPage {
            records,
            next_cursor,
        } = source
            .fetch_page(owner_id, query, cursor.as_deref())
            .await?;
        pages += 1;
        out.extend(records);

        if out.len() >= query.cap {
            if out.len() > query.cap || next_cursor.is_some() {
                tracing::warn!(
                    owner_id,
                    cap = query.cap,
                    pages,
                    "fetch safety cap reached; remaining records ignored"
                );
            }
            out.truncate(query.cap);
            break;
        }
        match next_cursor {
            Some(next) if Some(next.as_str()) != cursor.as_deref() => cursor = Some(next),
            Some(_) => {
                tracing::warn!(owner_id, pages, "record source repeated its cursor; stopping");
                break;
            }
            None => break,
        }
    }
    tracing::debug!(owner_id, pages, records = out.len(), "fetch complete");
    Ok(out)
}
