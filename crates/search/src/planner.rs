//! Query planning: Query + QueryOptions -> engine query tree, sort directive and offset.

use fleetq_core::{Query, QueryOptions, SortBy};
use tantivy::query::{AllQuery, BooleanQuery, EmptyQuery, Occur, Query as EngineQuery, QueryParser, QueryParserError, TermQuery};
use tantivy::schema::IndexRecordOption;
use tantivy::tokenizer::TokenStream;
use tantivy::Term;
use tracing::debug;

use crate::engine::IndexEngine;
use crate::error::{engine, IndexError, Result};

/// An executable search.
pub struct Plan {
    pub query: Box<dyn EngineQuery>,
    pub sort: SortBy,
    pub offset: usize,
}

impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plan").field("query", &self.query).field("sort", &self.sort.to_string()).field("offset", &self.offset).finish()
    }
}

/// Conjunction of match-all, the free-text clause (if any) and the filter clause (if any).
pub fn plan(engine: &IndexEngine, q: &Query, opts: &QueryOptions) -> Result<Plan> {
    let mut clauses: Vec<Box<dyn EngineQuery>> = vec![Box::new(AllQuery)];
    if !q.terms.trim().is_empty() {
        clauses.push(text_clause(engine, &q.terms)?);
    }
    if !q.filters.is_empty() {
        clauses.push(filter_clause(engine, &q.filters)?);
    }
    let plan = Plan { query: Box::new(BooleanQuery::intersection(clauses)), sort: opts.sort_by(), offset: opts.offset };
    debug!(terms = %q.terms, filters = ?q.filters, sort = %plan.sort, offset = plan.offset, "planned search");
    Ok(plan)
}

/// Free text matched against every projected field, each through its own analyzer.
/// Any token match qualifies a document.
fn text_clause(idx: &IndexEngine, terms: &str) -> Result<Box<dyn EngineQuery>> {
    let mut should: Vec<(Occur, Box<dyn EngineQuery>)> = Vec::new();
    for field in idx.fields().text_search() {
        let mut analyzer = idx.index().tokenizer_for_field(field).map_err(engine("resolve field analyzer"))?;
        for word in terms.split_whitespace() {
            let mut stream = analyzer.token_stream(word);
            while stream.advance() {
                let term = Term::from_field_text(field, &stream.token().text);
                should.push((Occur::Should, Box::new(TermQuery::new(term, IndexRecordOption::Basic)) as Box<dyn EngineQuery>));
            }
        }
    }
    if should.is_empty() {
        return Ok(Box::new(EmptyQuery));
    }
    Ok(Box::new(BooleanQuery::new(should)))
}

/// Filter expressions joined into one AND-ed clause. `search` and `remove_by_query` both go
/// through here so they select the same documents.
pub(crate) fn filter_clause(engine: &IndexEngine, filters: &[String]) -> Result<Box<dyn EngineQuery>> {
    parse_expression(engine, &fold_case(&filters.join(" ")))
}

/// Lowercase field names and values; `AND`, `OR` and `NOT` outside quotes stay operators.
fn fold_case(expr: &str) -> String {
    let mut out = String::with_capacity(expr.len());
    let mut word = String::new();
    let mut quoted = false;
    for c in expr.chars() {
        if c == '"' { quoted = !quoted; }
        if c.is_whitespace() && !quoted {
            push_word(&mut out, &mut word);
            out.push(c);
        } else {
            word.push(c);
        }
    }
    push_word(&mut out, &mut word);
    out
}

fn push_word(out: &mut String, word: &mut String) {
    match word.as_str() {
        "AND" | "OR" | "NOT" => out.push_str(word),
        w => out.push_str(&w.to_lowercase()),
    }
    word.clear();
}

/// Parse a structured filter expression (`field:value`, `+`/`-`, quoted phrases). Clauses are
/// AND-ed. A field the mapping does not know matches nothing rather than failing.
fn parse_expression(engine: &IndexEngine, expr: &str) -> Result<Box<dyn EngineQuery>> {
    let mut parser = QueryParser::for_index(engine.index(), engine.fields().free_text());
    parser.set_conjunction_by_default();
    match parser.parse_query(expr) {
        Ok(q) => Ok(q),
        Err(QueryParserError::FieldDoesNotExist(field)) => {
            debug!(field = %field, expr = %expr, "filter names unknown field; clause matches nothing");
            Ok(Box::new(EmptyQuery))
        }
        Err(source) => Err(IndexError::Query { query: expr.to_string(), source }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_plan_sorts_by_name_descending() {
        let e = IndexEngine::in_memory(20_000_000).unwrap();
        let p = plan(&e, &Query::all(), &QueryOptions::default()).unwrap();
        assert_eq!(p.sort.to_string(), "-name");
        assert_eq!(p.offset, 0);
        let p = plan(&e, &Query::all(), &QueryOptions::ascending().order_by("cluster").offset(3)).unwrap();
        assert_eq!(p.sort.to_string(), "cluster");
        assert_eq!(p.offset, 3);
    }

    #[test]
    fn fold_case_keeps_operators() {
        assert_eq!(fold_case(r#"Namespace:A OR ID:"c1/A/Pod/x OR y""#), r#"namespace:a OR id:"c1/a/pod/x or y""#);
        assert_eq!(fold_case("NOT kind:Pod  AND status:Running"), "NOT kind:pod  AND status:running");
    }

    #[test]
    fn malformed_filter_is_an_error() {
        let e = IndexEngine::in_memory(20_000_000).unwrap();
        let err = plan(&e, &Query::all().with_filter("namespace:(default"), &QueryOptions::default()).unwrap_err();
        assert!(matches!(err, IndexError::Query { .. }));
    }

    #[test]
    fn unknown_field_is_not_an_error() {
        let e = IndexEngine::in_memory(20_000_000).unwrap();
        assert!(plan(&e, &Query::all().with_filter("colour:blue"), &QueryOptions::default()).is_ok());
    }
}
