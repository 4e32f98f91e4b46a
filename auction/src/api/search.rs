//! `GET /api/search` - paged query over the search read model.

use super::error::ApiError;
use super::state::AppState;
use crate::search::{SearchPage, SearchQuery};
use axum::{
    Json,
    extract::{Query, State},
};

/// Run a search.
///
/// ```bash
/// curl 'http://localhost:8080/api/search?searchTerm=ford&filterBy=live&orderBy=new&pageSize=10'
/// ```
///
/// # Errors
///
/// `503` if the read model is unavailable.
pub async fn search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<SearchPage>, ApiError> {
    let page = state.search.query(query, state.clock.now()).await?;
    Ok(Json(page))
}
