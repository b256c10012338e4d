use chrono::{DateTime, NaiveDate};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::SiteRef;
use crate::model::*;

/// Parsed command from SQL input. The acting user never appears here; the
/// wire layer supplies it from the session.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertVisit {
        id: Ulid,
        listing_id: Ulid,
        visit_at: Option<VisitTime>,
    },
    /// Target status stays text so the state machine can reject it.
    UpdateVisitStatus {
        id: Ulid,
        status: String,
    },
    RejectPendingVisits {
        listing_id: Ulid,
    },
    SelectVisit {
        id: Ulid,
    },
    SelectVisitsByRequester {
        requester_id: Ulid,
    },
    SelectVisitsByController {
        controller_id: Ulid,
    },
    SelectApprovedVisitsOnDate {
        listing_id: Ulid,
        date: NaiveDate,
    },
    InsertLocation {
        latitude: f64,
        longitude: f64,
        area_name: Option<String>,
    },
    InsertApartment {
        id: Ulid,
        title: Option<String>,
        total_rent: Option<i64>,
        max_occupancy: Option<u32>,
        site: Option<SiteRef>,
    },
    UpdateApartment {
        id: Ulid,
        total_rent: Option<i64>,
        max_occupancy: Option<u32>,
    },
    InsertListing {
        id: Ulid,
        apartment_id: Ulid,
        kind: ListingKind,
        host_id: Option<Ulid>,
        price_per_person: i64,
    },
    UpdateListing {
        id: Ulid,
        price_per_person: Option<i64>,
        status: Option<ListingStatus>,
        verification: Option<Verification>,
    },
    SelectListings {
        id: Option<Ulid>,
    },
    SelectApartments {
        id: Option<Ulid>,
        location_id: Option<Ulid>,
    },
    SelectLocations,
    SelectMetrics {
        apartment_id: Option<Ulid>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => {
            let table = table_factor_name(&table.relation)?;
            let mut set = Fields::default();
            for a in assignments {
                let col = match &a.target {
                    AssignmentTarget::ColumnName(name) => object_name_last(name),
                    _ => None,
                }
                .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
                set.push(col, a.value.clone());
            }
            let mut filter = Fields::default();
            if let Some(sel) = selection {
                collect_eq_filters(sel, &mut filter)?;
            }
            parse_update(&table, &set, &filter)
        }
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Column → expression pairs from an INSERT row, SET list or WHERE clause.
#[derive(Debug, Default)]
struct Fields(Vec<(String, Expr)>);

impl Fields {
    fn push(&mut self, col: String, expr: Expr) {
        self.0.push((col, expr));
    }

    fn get(&self, col: &str) -> Option<&Expr> {
        self.0.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }

    fn require(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(col))
    }

    /// Column names, sorted; duplicates kept.
    fn columns(&self) -> Vec<&str> {
        let mut cols: Vec<&str> = self.0.iter().map(|(c, _)| c.as_str()).collect();
        cols.sort_unstable();
        cols
    }

    /// Refuse any column outside `allowed`.
    fn only(&self, allowed: &[&str], role: &str, table: &str) -> Result<(), SqlError> {
        match self.0.iter().find(|(c, _)| !allowed.contains(&c.as_str())) {
            Some((col, _)) => Err(SqlError::Unsupported(format!("{role} {col} on {table}"))),
            None => Ok(()),
        }
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let defaults: &[&str] = match table.as_str() {
        "visits" => &["id", "listing_id", "visit_at"],
        "locations" => &["latitude", "longitude", "area_name"],
        "apartments" => &["id", "title", "total_rent", "max_occupancy", "location_id"],
        "listings" => &["id", "apartment_id", "kind", "price_per_person", "host_id"],
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let row = insert_row(insert, defaults)?;
    let allowed: &[&str] = match table.as_str() {
        "apartments" => &[
            "id",
            "title",
            "total_rent",
            "max_occupancy",
            "location_id",
            "latitude",
            "longitude",
            "area_name",
        ],
        _ => defaults,
    };
    row.only(allowed, "column", &table)?;

    match table.as_str() {
        "visits" => Ok(Command::InsertVisit {
            id: parse_ulid(row.require("id")?)?,
            listing_id: parse_ulid(row.require("listing_id")?)?,
            visit_at: opt(row.get("visit_at"), parse_timestamp)?,
        }),
        "locations" => Ok(Command::InsertLocation {
            latitude: parse_f64(row.require("latitude")?)?,
            longitude: parse_f64(row.require("longitude")?)?,
            area_name: opt(row.get("area_name"), parse_text)?,
        }),
        "apartments" => {
            let location_id = opt(row.get("location_id"), parse_ulid)?;
            let latitude = opt(row.get("latitude"), parse_f64)?;
            let longitude = opt(row.get("longitude"), parse_f64)?;
            let site = match (location_id, latitude, longitude) {
                (Some(id), None, None) => Some(SiteRef::Bucket(id)),
                (None, Some(latitude), Some(longitude)) => Some(SiteRef::Coordinates {
                    latitude,
                    longitude,
                    area_name: opt(row.get("area_name"), parse_text)?,
                }),
                (None, None, None) => None,
                _ => {
                    return Err(SqlError::Parse(
                        "give either location_id or latitude and longitude".into(),
                    ));
                }
            };
            Ok(Command::InsertApartment {
                id: parse_ulid(row.require("id")?)?,
                title: opt(row.get("title"), parse_text)?,
                total_rent: opt(row.get("total_rent"), parse_i64)?,
                max_occupancy: opt(row.get("max_occupancy"), parse_u32)?,
                site,
            })
        }
        "listings" => Ok(Command::InsertListing {
            id: parse_ulid(row.require("id")?)?,
            apartment_id: parse_ulid(row.require("apartment_id")?)?,
            kind: parse_enum(row.require("kind")?)?,
            host_id: opt(row.get("host_id"), parse_ulid)?,
            price_per_person: parse_i64(row.require("price_per_person")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(table: &str, set: &Fields, filter: &Fields) -> Result<Command, SqlError> {
    match table {
        "visits" => {
            set.only(&["status"], "SET", table)?;
            let status = parse_text(set.require("status")?)?;
            match filter.columns().as_slice() {
                ["id"] => Ok(Command::UpdateVisitStatus {
                    id: parse_ulid(filter.require("id")?)?,
                    status,
                }),
                ["listing_id"] => {
                    if !status.eq_ignore_ascii_case("rejected") {
                        return Err(SqlError::Unsupported(
                            "bulk update of visits only sets status = 'rejected'".into(),
                        ));
                    }
                    Ok(Command::RejectPendingVisits {
                        listing_id: parse_ulid(filter.require("listing_id")?)?,
                    })
                }
                [] => Err(SqlError::MissingFilter("id")),
                cols => Err(SqlError::Unsupported(format!(
                    "visits update filtered on {}",
                    cols.join(", ")
                ))),
            }
        }
        "apartments" => {
            set.only(&["total_rent", "max_occupancy"], "SET", table)?;
            filter.only(&["id"], "filter on", table)?;
            Ok(Command::UpdateApartment {
                id: parse_ulid(filter.get("id").ok_or(SqlError::MissingFilter("id"))?)?,
                total_rent: opt(set.get("total_rent"), parse_i64)?,
                max_occupancy: opt(set.get("max_occupancy"), parse_u32)?,
            })
        }
        "listings" => {
            set.only(&["price_per_person", "status", "verification"], "SET", table)?;
            filter.only(&["id"], "filter on", table)?;
            Ok(Command::UpdateListing {
                id: parse_ulid(filter.get("id").ok_or(SqlError::MissingFilter("id"))?)?,
                price_per_person: opt(set.get("price_per_person"), parse_i64)?,
                status: opt(set.get("status"), parse_enum)?,
                verification: opt(set.get("verification"), parse_enum)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table.to_string())),
    }
}

/// Which read a SELECT is. Decided from the table and the exact set of
/// filter columns, never from the filter values, so a statement still
/// holding `$N` placeholders classifies the same as its bound form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectKind {
    Visit,
    VisitsByRequester,
    VisitsByController,
    ApprovedVisitsOnDate,
    Listings,
    Apartments,
    Locations,
    Metrics,
}

/// Classify a SELECT without binding its values. `None` for anything that
/// is not a supported SELECT.
pub fn select_kind(sql: &str) -> Option<SelectKind> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let Some(Statement::Query(query)) = stmts.first() else {
        return None;
    };
    let (table, filter) = select_parts(query).ok()?;
    classify_select(&table, &filter).ok()
}

fn select_parts(query: &ast::Query) -> Result<(String, Fields), SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filter = Fields::default();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filter)?;
    }
    Ok((table, filter))
}

fn classify_select(table: &str, filter: &Fields) -> Result<SelectKind, SqlError> {
    let cols = filter.columns();
    let kind = match (table, cols.as_slice()) {
        ("visits", ["id"]) => SelectKind::Visit,
        ("visits", ["requester_id"]) => SelectKind::VisitsByRequester,
        ("visits", ["controller_id"]) => SelectKind::VisitsByController,
        ("visits", ["listing_id", "visit_date"]) => SelectKind::ApprovedVisitsOnDate,
        ("visits", ["listing_id"]) => return Err(SqlError::MissingFilter("visit_date")),
        ("visits", []) => return Err(SqlError::MissingFilter("requester_id")),
        ("listings", [] | ["id"]) => SelectKind::Listings,
        ("apartments", []) => return Err(SqlError::MissingFilter("location_id")),
        ("apartments", ["id"] | ["location_id"] | ["id", "location_id"]) => SelectKind::Apartments,
        ("locations", []) => SelectKind::Locations,
        ("apartment_metrics", [] | ["apartment_id"]) => SelectKind::Metrics,
        ("visits" | "listings" | "apartments" | "locations" | "apartment_metrics", cols) => {
            return Err(SqlError::Unsupported(format!(
                "{table} filtered on {}",
                cols.join(", ")
            )));
        }
        _ => return Err(SqlError::UnknownTable(table.to_string())),
    };
    Ok(kind)
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let (table, filter) = select_parts(query)?;
    match classify_select(&table, &filter)? {
        SelectKind::Visit => Ok(Command::SelectVisit {
            id: parse_ulid(filter.require("id")?)?,
        }),
        SelectKind::VisitsByRequester => Ok(Command::SelectVisitsByRequester {
            requester_id: parse_ulid(filter.require("requester_id")?)?,
        }),
        SelectKind::VisitsByController => Ok(Command::SelectVisitsByController {
            controller_id: parse_ulid(filter.require("controller_id")?)?,
        }),
        SelectKind::ApprovedVisitsOnDate => Ok(Command::SelectApprovedVisitsOnDate {
            listing_id: parse_ulid(filter.require("listing_id")?)?,
            date: parse_date(filter.require("visit_date")?)?,
        }),
        SelectKind::Listings => Ok(Command::SelectListings {
            id: opt(filter.get("id"), parse_ulid)?,
        }),
        SelectKind::Apartments => Ok(Command::SelectApartments {
            id: opt(filter.get("id"), parse_ulid)?,
            location_id: opt(filter.get("location_id"), parse_ulid)?,
        }),
        SelectKind::Locations => Ok(Command::SelectLocations),
        SelectKind::Metrics => Ok(Command::SelectMetrics {
            apartment_id: opt(filter.get("apartment_id"), parse_ulid)?,
        }),
    }
}

/// `col = value [AND col = value ...]`. Other shapes are refused here;
/// which columns a table accepts is checked by the caller.
fn collect_eq_filters(expr: &Expr, out: &mut Fields) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push(col, right.as_ref().clone());
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

/// The single VALUES row, keyed by the column list or by `defaults` when
/// the statement has none.
fn insert_row(insert: &ast::Insert, defaults: &[&str]) -> Result<Fields, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let SetExpr::Values(values) = body.body.as_ref() else {
        return Err(SqlError::Parse("expected VALUES".into()));
    };
    let row = match values.rows.as_slice() {
        [row] => row,
        [] => return Err(SqlError::Parse("empty VALUES".into())),
        _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
    };

    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert
            .columns
            .iter()
            .map(|c| c.to_string().trim_matches('"').to_lowercase())
            .collect()
    };
    if row.len() > columns.len() || (!insert.columns.is_empty() && row.len() != columns.len()) {
        return Err(SqlError::WrongArity(columns.len(), row.len()));
    }

    let mut fields = Fields::default();
    for (col, expr) in columns.into_iter().zip(row.iter()) {
        fields.push(col, expr.clone());
    }
    Ok(fields)
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

/// Absent column or NULL → `None`.
fn opt<T>(
    expr: Option<&Expr>,
    parse: impl Fn(&Expr) -> Result<T, SqlError>,
) -> Result<Option<T>, SqlError> {
    match expr {
        None => Ok(None),
        Some(e) if is_null(e) => Ok(None),
        Some(e) => parse(e).map(Some),
    }
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// Numbers, quoted numbers (from bound parameters) and unary minus.
fn numeric_text(expr: &Expr) -> Result<String, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(format!("-{}", numeric_text(expr)?));
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => Ok(s.trim().to_string()),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    let s = numeric_text(expr)?;
    s.parse().map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_f64(expr: &Expr) -> Result<f64, SqlError> {
    let s = numeric_text(expr)?;
    s.parse().map_err(|e| SqlError::Parse(format!("bad number {s}: {e}")))
}

/// ISO-8601 with an explicit offset; a naive timestamp is ambiguous and refused.
fn parse_timestamp(expr: &Expr) -> Result<VisitTime, SqlError> {
    let s = parse_text(expr)?;
    DateTime::parse_from_rfc3339(s.trim())
        .map_err(|e| SqlError::Parse(format!("bad timestamp {s}: {e} (an offset is required)")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

fn parse_enum<T>(expr: &Expr) -> Result<T, SqlError>
where
    T: std::str::FromStr<Err = ParseEnumError>,
{
    parse_text(expr)?
        .parse()
        .map_err(|e: ParseEnumError| SqlError::Parse(e.to_string()))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const OTHER: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    #[test]
    fn insert_visit_keeps_offset() {
        let sql = format!(
            "INSERT INTO visits (id, listing_id, visit_at) VALUES ('{ID}', '{OTHER}', '2025-06-01T10:00:00+02:00')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertVisit { id, listing_id, visit_at } => {
                assert_eq!(id.to_string(), ID);
                assert_eq!(listing_id.to_string(), OTHER);
                let t = visit_at.unwrap();
                assert_eq!(t.offset().local_minus_utc(), 7200);
                assert_eq!(t.to_rfc3339(), "2025-06-01T10:00:00+02:00");
            }
            cmd => panic!("expected InsertVisit, got {cmd:?}"),
        }
    }

    #[test]
    fn insert_visit_columns_in_any_order() {
        let sql = format!("INSERT INTO visits (listing_id, id) VALUES ('{OTHER}', '{ID}')");
        match parse_sql(&sql).unwrap() {
            Command::InsertVisit { id, listing_id, visit_at } => {
                assert_eq!(id.to_string(), ID);
                assert_eq!(listing_id.to_string(), OTHER);
                assert_eq!(visit_at, None);
            }
            cmd => panic!("expected InsertVisit, got {cmd:?}"),
        }
    }

    #[test]
    fn insert_visit_without_offset_is_refused() {
        let sql = format!(
            "INSERT INTO visits (id, listing_id, visit_at) VALUES ('{ID}', '{OTHER}', '2025-06-01T10:00:00')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn update_visit_status() {
        let sql = format!("UPDATE visits SET status = 'approved' WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateVisitStatus {
                id: Ulid::from_string(ID).unwrap(),
                status: "approved".into(),
            }
        );
    }

    #[test]
    fn unknown_visit_status_passes_through() {
        let sql = format!("UPDATE visits SET status = 'pending' WHERE id = '{ID}'");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::UpdateVisitStatus { status, .. } if status == "pending"
        ));
    }

    #[test]
    fn bulk_reject_by_listing() {
        let sql = format!("UPDATE visits SET status = 'rejected' WHERE listing_id = '{OTHER}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::RejectPendingVisits {
                listing_id: Ulid::from_string(OTHER).unwrap()
            }
        );
    }

    #[test]
    fn bulk_approve_is_refused() {
        let sql = format!("UPDATE visits SET status = 'approved' WHERE listing_id = '{OTHER}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn select_visits_filters() {
        let by_requester = format!("SELECT * FROM visits WHERE requester_id = '{ID}'");
        assert!(matches!(
            parse_sql(&by_requester).unwrap(),
            Command::SelectVisitsByRequester { .. }
        ));

        let by_controller = format!("SELECT * FROM visits WHERE controller_id = '{ID}'");
        assert!(matches!(
            parse_sql(&by_controller).unwrap(),
            Command::SelectVisitsByController { .. }
        ));

        let on_date =
            format!("SELECT * FROM visits WHERE listing_id = '{OTHER}' AND visit_date = '2025-06-01'");
        match parse_sql(&on_date).unwrap() {
            Command::SelectApprovedVisitsOnDate { date, .. } => {
                assert_eq!(date, NaiveDate::from_ymd_opt(2025, 6, 1).unwrap());
            }
            cmd => panic!("expected SelectApprovedVisitsOnDate, got {cmd:?}"),
        }
    }

    #[test]
    fn select_visits_by_listing_needs_date() {
        let sql = format!("SELECT * FROM visits WHERE listing_id = '{OTHER}'");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingFilter("visit_date"))
        ));
    }

    #[test]
    fn extra_filters_are_refused() {
        for sql in [
            format!("SELECT * FROM visits WHERE requester_id = '{ID}' AND status = 'approved'"),
            format!("SELECT * FROM visits WHERE id = '{ID}' AND visit_date = '2025-06-01'"),
            format!("SELECT * FROM visits WHERE requester_id = '{ID}' AND requester_id = '{OTHER}'"),
            format!("SELECT * FROM listings WHERE apartment_id = '{ID}'"),
            format!("SELECT * FROM locations WHERE id = '{ID}'"),
            format!("UPDATE visits SET status = 'rejected' WHERE listing_id = '{ID}' AND requester_id = '{OTHER}'"),
            format!("UPDATE listings SET status = 'rented' WHERE id = '{ID}' AND apartment_id = '{OTHER}'"),
            format!("UPDATE apartments SET title = 'x' WHERE id = '{ID}'"),
        ] {
            assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))), "{sql}");
        }
    }

    #[test]
    fn unknown_insert_columns_are_refused() {
        let sql = format!("INSERT INTO visits (id, listing_id, requester_id) VALUES ('{ID}', '{OTHER}', '{OTHER}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn select_kind_ignores_placeholder_values() {
        assert_eq!(
            select_kind("SELECT * FROM visits WHERE listing_id = $1 AND visit_date = $2"),
            Some(SelectKind::ApprovedVisitsOnDate)
        );
        assert_eq!(
            select_kind("SELECT * FROM visits WHERE requester_id = $1"),
            Some(SelectKind::VisitsByRequester)
        );
        assert_eq!(select_kind("SELECT * FROM visits WHERE id = $1 AND visit_date = $2"), None);
        assert_eq!(select_kind("UPDATE visits SET status = $1 WHERE id = $2"), None);
        assert_eq!(select_kind("SELECT * FROM bookings"), None);
    }

    #[test]
    fn or_filters_are_refused() {
        let sql = format!("SELECT * FROM visits WHERE requester_id = '{ID}' OR id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn insert_apartment_with_coordinates() {
        let sql = format!(
            "INSERT INTO apartments (id, total_rent, max_occupancy, latitude, longitude, area_name) \
             VALUES ('{ID}', 12000, 3, 52.52, -13.405, 'Mitte')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertApartment {
                total_rent,
                max_occupancy,
                site,
                ..
            } => {
                assert_eq!(total_rent, Some(12000));
                assert_eq!(max_occupancy, Some(3));
                assert_eq!(
                    site,
                    Some(SiteRef::Coordinates {
                        latitude: 52.52,
                        longitude: -13.405,
                        area_name: Some("Mitte".into()),
                    })
                );
            }
            cmd => panic!("expected InsertApartment, got {cmd:?}"),
        }
    }

    #[test]
    fn insert_apartment_with_bucket_and_nulls() {
        let sql = format!(
            "INSERT INTO apartments (id, title, total_rent, max_occupancy, location_id) \
             VALUES ('{ID}', NULL, NULL, 2, '{OTHER}')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertApartment { title, total_rent, site, .. } => {
                assert_eq!(title, None);
                assert_eq!(total_rent, None);
                assert_eq!(site, Some(SiteRef::Bucket(Ulid::from_string(OTHER).unwrap())));
            }
            cmd => panic!("expected InsertApartment, got {cmd:?}"),
        }
    }

    #[test]
    fn insert_apartment_with_both_sites_is_refused() {
        let sql = format!(
            "INSERT INTO apartments (id, location_id, latitude, longitude) VALUES ('{ID}', '{OTHER}', 1.0, 2.0)"
        );
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn insert_room_share_listing() {
        let sql = format!(
            "INSERT INTO listings (id, apartment_id, kind, price_per_person, host_id) \
             VALUES ('{ID}', '{OTHER}', 'room_share', '4000', '{OTHER}')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertListing {
                kind,
                host_id,
                price_per_person,
                ..
            } => {
                assert_eq!(kind, ListingKind::RoomShare);
                assert!(host_id.is_some());
                assert_eq!(price_per_person, 4000);
            }
            cmd => panic!("expected InsertListing, got {cmd:?}"),
        }
    }

    #[test]
    fn update_listing_partial() {
        let sql = format!("UPDATE listings SET status = 'rented' WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateListing {
                id: Ulid::from_string(ID).unwrap(),
                price_per_person: None,
                status: Some(ListingStatus::Rented),
                verification: None,
            }
        );
    }

    #[test]
    fn update_listing_bad_status() {
        let sql = format!("UPDATE listings SET status = 'sold' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn update_apartment_rent() {
        let sql = format!("UPDATE apartments SET total_rent = 9000 WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateApartment {
                id: Ulid::from_string(ID).unwrap(),
                total_rent: Some(9000),
                max_occupancy: None,
            }
        );
    }

    #[test]
    fn insert_location_positional() {
        let sql = "INSERT INTO locations VALUES (48.8566, 2.3522)";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::InsertLocation {
                latitude: 48.8566,
                longitude: 2.3522,
                area_name: None,
            }
        );
    }

    #[test]
    fn select_catalog_tables() {
        assert_eq!(parse_sql("SELECT * FROM locations").unwrap(), Command::SelectLocations);
        assert_eq!(
            parse_sql("SELECT * FROM listings").unwrap(),
            Command::SelectListings { id: None }
        );
        assert_eq!(
            parse_sql("SELECT * FROM apartment_metrics").unwrap(),
            Command::SelectMetrics { apartment_id: None }
        );
        assert!(matches!(
            parse_sql("SELECT * FROM apartments"),
            Err(SqlError::MissingFilter("location_id"))
        ));
    }

    #[test]
    fn unknown_table_errors() {
        let sql = format!("INSERT INTO bookings (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
